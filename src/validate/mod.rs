//! SQL validation pipeline.
//!
//! Pattern-match based, not a parser. Table extraction only sees plain
//! `FROM ident` / `JOIN ident` shapes and the keyword scans are substring
//! matches; aliases, CTEs and quoted identifiers can slip through. That
//! permissiveness is deliberate and must not be silently tightened.

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::warn;

use crate::config::Phase;

/// Mutating/DDL keywords that are never allowed through unflagged.
const DANGEROUS_KEYWORDS: [&str; 7] = [
    "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "INSERT", "UPDATE",
];

/// Suspicious fragments scanned case-insensitively against the SQL text.
const INJECTION_PATTERNS: [&str; 9] = [
    r";\s*DROP",
    r";\s*DELETE",
    r";\s*UPDATE",
    r";\s*INSERT",
    r"UNION\s+SELECT",
    r"--",
    r"/\*",
    r"'\s*OR\s+'1'\s*=\s*'1",
    r"'\s*OR\s+1\s*=\s*1",
];

const AGGREGATE_FUNCTIONS: [&str; 5] = ["SUM", "COUNT", "AVG", "MAX", "MIN"];

/// Structured validation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub is_valid: bool,
    pub is_safe: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub security_issues: Vec<String>,
    pub complexity_score: u8,
    pub phase: Phase,
}

impl Verdict {
    fn clean(phase: Phase) -> Self {
        Self {
            is_valid: true,
            is_safe: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            security_issues: Vec::new(),
            complexity_score: 1,
            phase,
        }
    }
}

pub struct Validator {
    phase: Phase,
    max_rows: usize,
    injection: Vec<(&'static str, Regex)>,
    from_re: Regex,
    join_re: Regex,
    limit_re: Regex,
}

impl Validator {
    pub fn new(phase: Phase, max_rows: usize) -> Self {
        let injection = INJECTION_PATTERNS
            .iter()
            .map(|pat| (*pat, Regex::new(&format!("(?i){}", pat)).unwrap()))
            .collect();

        Self {
            phase,
            max_rows,
            injection,
            from_re: Regex::new(r"FROM\s+(\w+)").unwrap(),
            join_re: Regex::new(r"JOIN\s+(\w+)").unwrap(),
            limit_re: Regex::new(r"LIMIT\s+(\d+)").unwrap(),
        }
    }

    /// Main validation entry point.
    pub fn validate(&self, sql: &str, allowed_tables: &[String]) -> Verdict {
        match self.phase {
            Phase::Permissive => self.validate_permissive(sql),
            Phase::Demonstrative => self.validate_demonstrative(sql, allowed_tables),
            Phase::Strict => self.validate_strict(sql, allowed_tables),
        }
    }

    /// Basic syntax only.
    fn validate_permissive(&self, sql: &str) -> Verdict {
        let mut result = Verdict::clean(Phase::Permissive);

        if let Some(error) = check_basic_syntax(sql) {
            result.is_valid = false;
            result.errors.push(error);
        }

        result
    }

    /// Security checks run and report, but the caller decides what to do.
    fn validate_demonstrative(&self, sql: &str, allowed_tables: &[String]) -> Verdict {
        let mut result = Verdict::clean(Phase::Demonstrative);
        self.run_security_checks(sql, allowed_tables, &mut result);
        result
    }

    /// Full pipeline: security checks short-circuit, then complexity and
    /// the advisory LIMIT check.
    fn validate_strict(&self, sql: &str, allowed_tables: &[String]) -> Verdict {
        let mut result = Verdict::clean(Phase::Strict);
        self.run_security_checks(sql, allowed_tables, &mut result);

        if !result.is_valid || !result.is_safe {
            return result;
        }

        result.complexity_score = complexity_score(sql);

        if let Some(limit_warning) = self.check_result_limit(sql) {
            result.warnings.push(limit_warning);
        }

        result
    }

    /// Checks 1-4. A syntax failure terminates the pipeline early.
    fn run_security_checks(&self, sql: &str, allowed_tables: &[String], result: &mut Verdict) {
        // Basic syntax
        if let Some(error) = check_basic_syntax(sql) {
            result.is_valid = false;
            result.errors.push(error);
            return;
        }

        // SQL injection patterns
        let detected = self.scan_injection(sql);
        if !detected.is_empty() {
            result.is_safe = false;
            result.security_issues.extend(detected);
            result.errors.push("SQL injection attempt detected".to_string());
        }

        // Dangerous operations
        let (dangerous, op_warnings) = scan_dangerous_operations(sql);
        if !dangerous.is_empty() {
            result.is_safe = false;
            result
                .security_issues
                .push(format!("Dangerous operations: {}", dangerous.join(", ")));
            result.warnings.extend(op_warnings);
        }

        // Table references
        if let Some(unauthorized) = self.check_table_references(sql, allowed_tables) {
            result.is_valid = false;
            result.errors.push(format!(
                "Unauthorized table reference(s): {}",
                unauthorized.join(", ")
            ));
        }
    }

    fn scan_injection(&self, sql: &str) -> Vec<String> {
        let mut detected = Vec::new();

        for (pattern, re) in &self.injection {
            if re.is_match(sql) {
                warn!("SQL injection attempt detected: {}", pattern);
                detected.push(format!("Detected injection pattern: {}", pattern));
            }
        }

        detected
    }

    /// Returns the referenced tables not present in the allowed set, or
    /// None when everything checks out. Best-effort extraction only.
    fn check_table_references(&self, sql: &str, allowed_tables: &[String]) -> Option<Vec<String>> {
        let sql_upper = sql.to_uppercase();
        let allowed: BTreeSet<String> =
            allowed_tables.iter().map(|t| t.to_uppercase()).collect();

        let mut referenced = BTreeSet::new();
        for cap in self.from_re.captures_iter(&sql_upper) {
            if let Some(name) = cap.get(1) {
                referenced.insert(name.as_str().to_string());
            }
        }
        for cap in self.join_re.captures_iter(&sql_upper) {
            if let Some(name) = cap.get(1) {
                referenced.insert(name.as_str().to_string());
            }
        }

        let unauthorized: Vec<String> = referenced.difference(&allowed).cloned().collect();

        if unauthorized.is_empty() {
            None
        } else {
            Some(unauthorized)
        }
    }

    /// Advisory only: a missing or oversized LIMIT produces a warning, not
    /// a verdict change.
    fn check_result_limit(&self, sql: &str) -> Option<String> {
        let sql_upper = sql.to_uppercase();

        if !sql_upper.contains("LIMIT") {
            return Some(format!(
                "Query should include LIMIT clause (max {} rows)",
                self.max_rows
            ));
        }

        if let Some(cap) = self.limit_re.captures(&sql_upper) {
            if let Some(value) = cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) {
                if value > self.max_rows {
                    return Some(format!(
                        "LIMIT {} exceeds maximum of {} rows",
                        value, self.max_rows
                    ));
                }
            }
        }

        None
    }
}

/// Non-empty, contains SELECT and FROM, balanced parentheses.
fn check_basic_syntax(sql: &str) -> Option<String> {
    if sql.trim().is_empty() {
        return Some("Empty SQL query".to_string());
    }

    let sql_upper = sql.to_uppercase();

    if !sql_upper.contains("SELECT") {
        return Some("Query must contain SELECT statement".to_string());
    }

    if !sql_upper.contains("FROM") {
        return Some("Query must contain FROM clause".to_string());
    }

    if sql.matches('(').count() != sql.matches(')').count() {
        return Some("Unmatched parentheses in query".to_string());
    }

    None
}

/// Returns (matched keywords, per-keyword warnings). Substring matching,
/// exactly as permissive as the table extractor above.
fn scan_dangerous_operations(sql: &str) -> (Vec<String>, Vec<String>) {
    let sql_upper = sql.to_uppercase();
    let mut dangerous = Vec::new();
    let mut warnings = Vec::new();

    for keyword in DANGEROUS_KEYWORDS {
        if sql_upper.contains(keyword) {
            dangerous.push(keyword.to_string());

            match keyword {
                "DELETE" | "UPDATE" => {
                    if !sql_upper.contains("WHERE") {
                        warnings.push(format!(
                            "{} operation without WHERE clause - affects all rows!",
                            keyword
                        ));
                    } else {
                        warnings.push(format!(
                            "{} operation detected - requires confirmation",
                            keyword
                        ));
                    }
                }
                "DROP" | "TRUNCATE" | "ALTER" => {
                    warnings.push(format!(
                        "{} operation detected - extremely dangerous!",
                        keyword
                    ));
                }
                _ => {}
            }
        }
    }

    (dangerous, warnings)
}

/// Complexity estimate clamped to [1, 10]: JOINs, subqueries, aggregation,
/// GROUP BY and window functions each contribute.
pub fn complexity_score(sql: &str) -> u8 {
    let sql_upper = sql.to_uppercase();
    let mut score: usize = 1;

    // Each JOIN adds a point, capped at 3
    let join_count = sql_upper.matches("JOIN").count();
    score += join_count.min(3);

    // Extra SELECTs stand in for subqueries, 2 points each capped at 4
    let subquery_count = sql_upper.matches("SELECT").count().saturating_sub(1);
    score += (subquery_count * 2).min(4);

    // Aggregations
    if AGGREGATE_FUNCTIONS.iter().any(|f| sql_upper.contains(f)) {
        score += 1;
    }

    if sql_upper.contains("GROUP BY") {
        score += 1;
    }

    // Window functions
    if sql_upper.contains("OVER") {
        score += 2;
    }

    score.clamp(1, 10) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn strict() -> Validator {
        Validator::new(Phase::Strict, 10_000)
    }

    #[test]
    fn empty_sql_is_invalid() {
        let verdict = strict().validate("", &allowed(&["customers"]));
        assert!(!verdict.is_valid);
        assert_eq!(verdict.errors, vec!["Empty SQL query"]);
    }

    #[test]
    fn missing_select_and_from_are_caught() {
        let v = strict();
        let verdict = v.validate("UPDATE x SET y = 1", &allowed(&["x"]));
        assert!(!verdict.is_valid);
        assert_eq!(verdict.errors, vec!["Query must contain SELECT statement"]);

        let verdict = v.validate("SELECT 1", &allowed(&[]));
        assert_eq!(verdict.errors, vec!["Query must contain FROM clause"]);
    }

    #[test]
    fn unbalanced_parentheses_are_invalid() {
        let verdict = strict().validate(
            "SELECT COUNT( FROM customers",
            &allowed(&["customers"]),
        );
        assert!(!verdict.is_valid);
        assert_eq!(verdict.errors, vec!["Unmatched parentheses in query"]);
    }

    #[test]
    fn stacked_drop_is_flagged_as_injection_and_dangerous() {
        let verdict = strict().validate(
            "SELECT * FROM customers; DROP TABLE customers;",
            &allowed(&["customers"]),
        );
        assert!(!verdict.is_safe);
        assert!(verdict
            .security_issues
            .iter()
            .any(|i| i.contains("Detected injection pattern")));
        assert!(verdict
            .security_issues
            .iter()
            .any(|i| i.contains("Dangerous operations") && i.contains("DROP")));
        // Unsafe verdicts always carry at least one issue
        assert!(!verdict.security_issues.is_empty());
    }

    #[test]
    fn tautology_injection_is_detected() {
        let verdict = strict().validate(
            "SELECT * FROM users WHERE name = '' OR '1'='1'",
            &allowed(&["users"]),
        );
        assert!(!verdict.is_safe);
        assert!(verdict.errors.contains(&"SQL injection attempt detected".to_string()));
    }

    #[test]
    fn comment_markers_are_injection_patterns() {
        let verdict = strict().validate(
            "SELECT * FROM users -- hidden",
            &allowed(&["users"]),
        );
        assert!(!verdict.is_safe);
    }

    #[test]
    fn delete_with_where_gets_confirmation_warning() {
        let v = Validator::new(Phase::Demonstrative, 10_000);
        let verdict = v.validate(
            "SELECT 1 FROM t; DELETE FROM t WHERE id = 4",
            &allowed(&["t"]),
        );
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w == "DELETE operation detected - requires confirmation"));
        assert!(!verdict.is_safe);
    }

    #[test]
    fn delete_without_where_gets_elevated_warning() {
        let v = Validator::new(Phase::Demonstrative, 10_000);
        let verdict = v.validate("SELECT 1 FROM t; DELETE FROM t", &allowed(&["t"]));
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w == "DELETE operation without WHERE clause - affects all rows!"));
        assert!(!verdict.is_safe);
    }

    #[test]
    fn truncate_always_gets_extreme_warning() {
        let v = Validator::new(Phase::Demonstrative, 10_000);
        let verdict = v.validate(
            "SELECT 1 FROM t WHERE 1=0; TRUNCATE t",
            &allowed(&["t"]),
        );
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w == "TRUNCATE operation detected - extremely dangerous!"));
    }

    #[test]
    fn unauthorized_tables_are_named() {
        let verdict = strict().validate(
            "SELECT * FROM orders JOIN secrets ON orders.id = secrets.id",
            &allowed(&["orders"]),
        );
        assert!(!verdict.is_valid);
        assert!(verdict
            .errors
            .iter()
            .any(|e| e.contains("Unauthorized table reference(s): SECRETS")));
    }

    #[test]
    fn allow_list_is_case_insensitive() {
        let verdict = strict().validate(
            "select id from Orders limit 10",
            &allowed(&["ORDERS"]),
        );
        assert!(verdict.is_valid);
        assert!(verdict.is_safe);
    }

    #[test]
    fn strict_short_circuits_before_complexity() {
        let verdict = strict().validate(
            "SELECT * FROM hidden_table",
            &allowed(&["visible"]),
        );
        assert!(!verdict.is_valid);
        // Complexity stays at the default because checks 5-6 never ran
        assert_eq!(verdict.complexity_score, 1);
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn strict_never_mixes_valid_with_errors() {
        let v = strict();
        for sql in [
            "",
            "SELECT * FROM t; DROP TABLE t",
            "SELECT * FROM nope",
            "SELECT a FROM t LIMIT 5",
        ] {
            let verdict = v.validate(sql, &allowed(&["t"]));
            if verdict.is_valid {
                assert!(verdict.errors.is_empty(), "valid verdict with errors for {:?}", sql);
            }
            if verdict.is_safe {
                assert!(
                    verdict.security_issues.is_empty(),
                    "safe verdict with security issues for {:?}",
                    sql
                );
            }
        }
    }

    #[test]
    fn missing_limit_is_advisory_only() {
        let verdict = strict().validate("SELECT a FROM t", &allowed(&["t"]));
        assert!(verdict.is_valid);
        assert!(verdict.is_safe);
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w == "Query should include LIMIT clause (max 10000 rows)"));
    }

    #[test]
    fn oversized_limit_is_advisory_only() {
        let v = Validator::new(Phase::Strict, 100);
        let verdict = v.validate("SELECT a FROM t LIMIT 5000", &allowed(&["t"]));
        assert!(verdict.is_valid);
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w == "LIMIT 5000 exceeds maximum of 100 rows"));
    }

    #[test]
    fn permissive_runs_basic_syntax_only() {
        let v = Validator::new(Phase::Permissive, 10_000);
        // Injection and allow-list violations pass through untouched
        let verdict = v.validate(
            "SELECT * FROM secrets; DROP TABLE secrets",
            &allowed(&["visible"]),
        );
        assert!(verdict.is_valid);
        assert!(verdict.is_safe);
        assert!(verdict.security_issues.is_empty());
    }

    #[test]
    fn demonstrative_reports_without_blocking_flags() {
        let v = Validator::new(Phase::Demonstrative, 10_000);
        let verdict = v.validate(
            "SELECT * FROM t UNION SELECT * FROM t",
            &allowed(&["t"]),
        );
        // Safety flag is accurate; the caller decides whether to proceed
        assert!(!verdict.is_safe);
        assert!(verdict.is_valid);
    }

    #[test]
    fn complexity_is_clamped_for_garbage() {
        assert_eq!(complexity_score(""), 1);
        assert_eq!(complexity_score("not sql at all"), 1);
        let monster = "SELECT SELECT SELECT JOIN JOIN JOIN JOIN GROUP BY OVER SUM";
        assert!(complexity_score(monster) <= 10);
        assert!(complexity_score(monster) >= 1);
    }

    #[test]
    fn complexity_counts_joins_and_aggregates() {
        assert_eq!(complexity_score("SELECT a FROM t"), 1);
        assert_eq!(complexity_score("SELECT a FROM t JOIN u ON 1=1"), 2);
        assert_eq!(
            complexity_score("SELECT COUNT(*) FROM t JOIN u ON 1=1 GROUP BY a"),
            4
        );
        assert_eq!(
            complexity_score("SELECT SUM(x) OVER (PARTITION BY y) FROM t"),
            4
        );
    }

    #[test]
    fn complexity_counts_subqueries() {
        let sql = "SELECT a FROM t WHERE a IN (SELECT b FROM t)";
        // 1 base + 2 for one extra SELECT
        assert_eq!(complexity_score(sql), 3);
    }
}
