//! Request orchestration: cache probe, generation, validation, guarded
//! execution, cache fill and history persistence.

pub mod chain;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::key::{cache_key, schema_fingerprint};
use crate::cache::store::{summarize, CacheEntry, CacheStats, QueryCache};
use crate::config::{LimitsConfig, Phase};
use crate::error::{ErrorKind, QueryError};
use crate::exec::{ExecutionGuard, QueryExecutor};
use crate::history::{Feedback, HistoryStore, QueryAttempt};
use crate::llm::{GenerationRequest, SqlGenerator};
use crate::quota::QuotaService;
use crate::schema::catalog::TableCatalog;
use crate::schema::SchemaContextBuilder;
use crate::validate::{Validator, Verdict};

use chain::RefinementChain;

const UNAUTHORIZED_PREFIX: &str = "Unauthorized table reference(s): ";

#[derive(Debug, Clone, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

/// What a generate/refine call hands back to the surface layer. Execution
/// failures are reported here with `success=false` rather than as errors;
/// retry is a user decision, never automatic.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub attempt_id: String,
    pub parent_attempt_id: Option<String>,
    pub attempt_number: u32,
    pub sql: String,
    pub explanation: String,
    pub success: bool,
    pub rows: Option<Vec<Value>>,
    pub columns: Option<Vec<String>>,
    pub row_count: Option<usize>,
    pub truncated: bool,
    pub execution_time_ms: u64,
    pub cache_hit: bool,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub validation: Verdict,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

struct CacheFill {
    key: String,
    fingerprint: String,
}

/// Composes the collaborators for one deployment. All handles are owned by
/// the caller and passed in at construction; the orchestrator itself keeps
/// no mutable state between requests.
pub struct Orchestrator {
    phase: Phase,
    limits: LimitsConfig,
    catalog: Arc<dyn TableCatalog>,
    context_builder: SchemaContextBuilder,
    cache: Arc<dyn QueryCache>,
    generator: Arc<dyn SqlGenerator>,
    validator: Validator,
    guard: ExecutionGuard,
    history: Arc<dyn HistoryStore>,
    quota: Arc<dyn QuotaService>,
    chain: RefinementChain,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        phase: Phase,
        limits: LimitsConfig,
        catalog: Arc<dyn TableCatalog>,
        cache: Arc<dyn QueryCache>,
        generator: Arc<dyn SqlGenerator>,
        executor: Arc<dyn QueryExecutor>,
        history: Arc<dyn HistoryStore>,
        quota: Arc<dyn QuotaService>,
    ) -> Self {
        let context_builder = SchemaContextBuilder::new(limits.max_schema_chars);
        let validator = Validator::new(phase, limits.max_result_rows);
        let guard = ExecutionGuard::new(
            executor,
            Duration::from_secs(limits.statement_timeout_secs),
            limits.max_result_rows,
        );
        let chain = RefinementChain::new(Arc::clone(&history), limits.max_refinement_depth);

        Self {
            phase,
            limits,
            catalog,
            context_builder,
            cache,
            generator,
            validator,
            guard,
            history,
            quota,
            chain,
        }
    }

    /// Full generation round: cache probe, generation, validation, guarded
    /// execution, cache fill and history.
    pub async fn generate(
        &self,
        tenant: &str,
        question: &str,
        tables: &[String],
    ) -> Result<QueryOutcome, QueryError> {
        // Quota gate runs in strict phase only
        if self.phase == Phase::Strict {
            let within = self
                .quota
                .within_limit(tenant)
                .await
                .map_err(|e| QueryError::Internal(e.to_string()))?;
            if !within {
                return Err(QueryError::QuotaExceeded);
            }
        }

        info!("Generating query for tenant {}: '{}'", tenant, question);
        let started = Instant::now();

        let table_schemas = self
            .catalog
            .ddl_for(tenant, tables)
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?;

        if table_schemas.is_empty() {
            return Err(QueryError::TablesNotFound {
                names: tables.to_vec(),
            });
        }

        let schema_context = self.context_builder.render(&table_schemas);
        let ddls: Vec<String> = table_schemas.iter().map(|t| t.ddl.clone()).collect();
        let fingerprint = schema_fingerprint(&ddls);

        // Cache probe, strict phase only
        if self.phase == Phase::Strict {
            let key = cache_key(tenant, question, &fingerprint);
            if let Some(entry) = self.cache.get(&key).await {
                info!("Cache hit, skipping generation for tenant {}", tenant);
                self.cache.increment_hit_count(&key).await;

                // Still validate cached SQL; the allow-list may have moved
                let verdict = self.validator.validate(&entry.sql, tables);

                let mut attempt = self.chain.begin(tenant, question, tables);
                attempt.sql = entry.sql.clone();
                attempt.explanation = entry.explanation.clone();
                attempt.cache_hit = true;
                apply_verdict(&mut attempt, &verdict);
                // No generation call happened: zero tokens, zero cost

                return Ok(self.execute_and_record(attempt, verdict, started, None).await);
            }
            debug!("Cache miss for key: {}...", &key[..16]);
        }

        let request = GenerationRequest {
            question: question.to_string(),
            schema_context,
            previous_attempt: None,
        };
        let generated = self.generator.generate(&request).await?;

        let verdict = self.validator.validate(&generated.sql, tables);
        let cost = crate::llm::prompt::estimate_cost(generated.input_tokens, generated.output_tokens);

        let mut attempt = self.chain.begin(tenant, question, tables);
        attempt.sql = generated.sql.clone();
        attempt.explanation = generated.explanation.clone();
        attempt.input_tokens = generated.input_tokens;
        attempt.output_tokens = generated.output_tokens;
        attempt.estimated_cost_usd = cost;
        apply_verdict(&mut attempt, &verdict);

        if self.phase == Phase::Strict && (!verdict.is_safe || !verdict.is_valid) {
            return Err(self.block_attempt(attempt, &verdict).await);
        }

        if self.phase == Phase::Demonstrative && !verdict.is_safe {
            // Surface but do not block; the caller sees the verdict
            warn!("Security validation failed: {:?}", verdict.security_issues);
        }

        let fill = (self.phase == Phase::Strict).then(|| CacheFill {
            key: cache_key(tenant, question, &fingerprint),
            fingerprint: fingerprint.clone(),
        });

        let outcome = self.execute_and_record(attempt, verdict, started, fill).await;

        // Generation actually ran, so count it. Best-effort.
        if let Err(e) = self.quota.increment(tenant).await {
            error!("Failed to increment query count for {}: {}", tenant, e);
        }

        Ok(outcome)
    }

    /// User-directed retry of a failed attempt.
    pub async fn refine(
        &self,
        tenant: &str,
        parent_id: &str,
        user_note: Option<&str>,
    ) -> Result<QueryOutcome, QueryError> {
        let (mut attempt, context) = self.chain.refine(tenant, parent_id, user_note).await?;

        info!(
            "Refining query {} (attempt {}) for tenant {}",
            parent_id, attempt.attempt_number, tenant
        );
        let started = Instant::now();

        let table_schemas = self
            .catalog
            .ddl_for(tenant, &attempt.tables)
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?;
        let schema_context = self.context_builder.render(&table_schemas);

        let request = GenerationRequest {
            question: attempt.question.clone(),
            schema_context,
            previous_attempt: Some(context),
        };
        let generated = self.generator.generate(&request).await?;

        let verdict = self.validator.validate(&generated.sql, &attempt.tables);
        let cost = crate::llm::prompt::estimate_cost(generated.input_tokens, generated.output_tokens);

        attempt.sql = generated.sql.clone();
        attempt.explanation = generated.explanation.clone();
        attempt.input_tokens = generated.input_tokens;
        attempt.output_tokens = generated.output_tokens;
        attempt.estimated_cost_usd = cost;
        apply_verdict(&mut attempt, &verdict);

        if self.phase == Phase::Strict && (!verdict.is_safe || !verdict.is_valid) {
            return Err(self.block_attempt(attempt, &verdict).await);
        }

        // Refinements bypass the cache entirely, probe and fill alike
        Ok(self.execute_and_record(attempt, verdict, started, None).await)
    }

    /// Attach user feedback to an attempt. Last write wins.
    pub async fn feedback(
        &self,
        tenant: &str,
        attempt_id: &str,
        feedback: &Feedback,
    ) -> Result<(), QueryError> {
        let attempt = self
            .history
            .get(attempt_id)
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?;

        // An attempt that is missing or owned elsewhere looks the same to
        // the caller.
        match attempt {
            Some(a) if a.tenant == tenant => {}
            _ => return Err(QueryError::AccessDenied),
        }

        feedback.validate().map_err(QueryError::InvalidFeedback)?;

        self.history
            .update_feedback(attempt_id, feedback)
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?;

        info!(
            "Feedback saved for query {}: rating={:?}",
            attempt_id, feedback.rating
        );
        Ok(())
    }

    /// Tenant-gated attempt lookup.
    pub async fn attempt(&self, tenant: &str, attempt_id: &str) -> Result<QueryAttempt, QueryError> {
        let attempt = self
            .history
            .get(attempt_id)
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?
            .ok_or_else(|| QueryError::AttemptNotFound(attempt_id.to_string()))?;

        if attempt.tenant != tenant {
            return Err(QueryError::AccessDenied);
        }

        Ok(attempt)
    }

    pub async fn cache_stats(&self, tenant: &str) -> CacheStats {
        let entries = self.cache.list_by_tenant(tenant, 10).await;
        summarize(&entries)
    }

    pub async fn invalidate_cache(&self, tenant: &str) -> usize {
        self.cache.delete_by_tenant(tenant).await
    }

    /// Relationship-enhanced schema context for inspection.
    pub async fn schema_context(
        &self,
        tenant: &str,
        tables: &[String],
    ) -> Result<String, QueryError> {
        let table_schemas = self
            .catalog
            .ddl_for(tenant, tables)
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?;

        if table_schemas.is_empty() {
            return Err(QueryError::TablesNotFound {
                names: tables.to_vec(),
            });
        }

        Ok(self.context_builder.render_with_relationships(&table_schemas))
    }

    /// Record a strict-phase validation block and map it onto the error
    /// taxonomy. The SQL is stored in history but never executed.
    async fn block_attempt(&self, mut attempt: QueryAttempt, verdict: &Verdict) -> QueryError {
        let (kind, message) = if !verdict.is_safe {
            (ErrorKind::Security, verdict.security_issues.join("; "))
        } else {
            (ErrorKind::Validation, verdict.errors.join("; "))
        };

        error!("Blocked query for tenant {}: {}", attempt.tenant, message);

        attempt.success = false;
        attempt.error_message = Some(message.clone());
        attempt.error_kind = Some(kind);
        self.record(&attempt).await;

        if !verdict.is_safe {
            return QueryError::UnsafeSql {
                attempt_id: attempt.id,
                sql: attempt.sql,
                issues: verdict.security_issues.clone(),
            };
        }

        let unauthorized = unauthorized_names(&verdict.errors);
        if !unauthorized.is_empty() {
            return QueryError::UnauthorizedTable {
                attempt_id: attempt.id,
                names: unauthorized,
            };
        }

        QueryError::InvalidSyntax {
            attempt_id: attempt.id,
            message,
        }
    }

    /// Run the SQL under the guard, absorb side-effect failures, persist
    /// the attempt and shape the outcome.
    async fn execute_and_record(
        &self,
        mut attempt: QueryAttempt,
        verdict: Verdict,
        started: Instant,
        fill: Option<CacheFill>,
    ) -> QueryOutcome {
        let exec = self.guard.run(&attempt.tenant, &attempt.sql, self.phase).await;
        let elapsed = started.elapsed().as_millis() as u64;
        attempt.execution_time_ms = Some(elapsed);

        match exec {
            Ok(result) => {
                attempt.success = true;
                attempt.rows_returned = Some(result.row_count);

                // Cache only validated, successfully executed queries
                if let Some(fill) = fill {
                    let now = Utc::now().timestamp();
                    self.cache
                        .put(CacheEntry {
                            cache_key: fill.key,
                            tenant: attempt.tenant.clone(),
                            question: attempt.question.clone(),
                            tables: attempt.tables.clone(),
                            sql: attempt.sql.clone(),
                            explanation: attempt.explanation.clone(),
                            schema_fingerprint: fill.fingerprint,
                            created_at: now,
                            expires_at: now + self.limits.cache_ttl_secs as i64,
                            hit_count: 0,
                        })
                        .await;
                    debug!("Query cached for future use");
                }

                self.record(&attempt).await;

                QueryOutcome {
                    attempt_id: attempt.id,
                    parent_attempt_id: attempt.parent_id,
                    attempt_number: attempt.attempt_number,
                    sql: attempt.sql,
                    explanation: attempt.explanation,
                    success: true,
                    rows: Some(result.rows),
                    columns: Some(result.columns),
                    row_count: Some(result.row_count),
                    truncated: result.truncated,
                    execution_time_ms: elapsed,
                    cache_hit: attempt.cache_hit,
                    tokens: TokenUsage {
                        input: attempt.input_tokens,
                        output: attempt.output_tokens,
                    },
                    cost_usd: attempt.estimated_cost_usd,
                    validation: verdict,
                    error: None,
                    error_kind: None,
                }
            }
            Err(failure) => {
                attempt.success = false;
                attempt.error_message = Some(failure.message.clone());
                attempt.error_kind = Some(failure.kind);

                self.record(&attempt).await;

                QueryOutcome {
                    attempt_id: attempt.id,
                    parent_attempt_id: attempt.parent_id,
                    attempt_number: attempt.attempt_number,
                    sql: attempt.sql,
                    explanation: attempt.explanation,
                    success: false,
                    rows: None,
                    columns: None,
                    row_count: None,
                    truncated: false,
                    execution_time_ms: elapsed,
                    cache_hit: attempt.cache_hit,
                    tokens: TokenUsage {
                        input: attempt.input_tokens,
                        output: attempt.output_tokens,
                    },
                    cost_usd: attempt.estimated_cost_usd,
                    validation: verdict,
                    error: Some(failure.message),
                    error_kind: Some(failure.kind),
                }
            }
        }
    }

    /// History writes never change the user-visible result.
    async fn record(&self, attempt: &QueryAttempt) {
        if let Err(e) = self.history.save(attempt).await {
            error!("Failed to save query history for {}: {}", attempt.id, e);
        }
    }
}

fn apply_verdict(attempt: &mut QueryAttempt, verdict: &Verdict) {
    attempt.syntax_valid = verdict.is_valid;
    attempt.security_passed = verdict.is_safe;
    attempt.complexity_score = verdict.complexity_score;
}

/// Recover the unauthorized identifiers from the validator's error text.
fn unauthorized_names(errors: &[String]) -> Vec<String> {
    errors
        .iter()
        .find_map(|e| e.strip_prefix(UNAUTHORIZED_PREFIX))
        .map(|names| names.split(", ").map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ResultSet;
    use crate::history::{FeedbackKind, MemoryHistory};
    use crate::llm::{Generated, LlmError};
    use crate::schema::TableSchema;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    type BoxError = Box<dyn std::error::Error + Send + Sync>;

    struct MockCatalog {
        tables: Vec<TableSchema>,
    }

    #[async_trait]
    impl TableCatalog for MockCatalog {
        async fn ddl_for(
            &self,
            _tenant: &str,
            _table_names: &[String],
        ) -> Result<Vec<TableSchema>, BoxError> {
            Ok(self.tables.clone())
        }
    }

    struct MockGenerator {
        sql: String,
        fail: bool,
        calls: AtomicUsize,
        last_request: Mutex<Option<GenerationRequest>>,
    }

    impl MockGenerator {
        fn returning(sql: &str) -> Self {
            Self {
                sql: sql.to_string(),
                fail: false,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SqlGenerator for MockGenerator {
        async fn generate(&self, request: &GenerationRequest) -> Result<Generated, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().await = Some(request.clone());
            if self.fail {
                return Err(LlmError::ConnectionError("connection refused".to_string()));
            }
            Ok(Generated {
                sql: self.sql.clone(),
                explanation: "generated for test".to_string(),
                input_tokens: 900,
                output_tokens: 100,
            })
        }
    }

    struct MockExecutor {
        result: Result<ResultSet, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueryExecutor for MockExecutor {
        async fn execute(&self, _tenant: &str, _sql: &str) -> Result<ResultSet, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(rs) => Ok(rs.clone()),
                Err(msg) => Err(msg.clone().into()),
            }
        }
    }

    struct MockQuota {
        within: bool,
        increments: AtomicUsize,
    }

    #[async_trait]
    impl QuotaService for MockQuota {
        async fn within_limit(&self, _tenant: &str) -> Result<bool, BoxError> {
            Ok(self.within)
        }

        async fn increment(&self, _tenant: &str) -> Result<(), BoxError> {
            self.increments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        cache: Arc<crate::cache::store::MemoryCache>,
        history: Arc<MemoryHistory>,
        generator: Arc<MockGenerator>,
        executor: Arc<MockExecutor>,
        quota: Arc<MockQuota>,
    }

    fn sales_rows() -> ResultSet {
        ResultSet {
            columns: vec!["region".to_string(), "total".to_string()],
            rows: vec![json!({"region": "west", "total": 100})],
        }
    }

    fn harness_with(
        phase: Phase,
        generated_sql: &str,
        exec_result: Result<ResultSet, String>,
        within_quota: bool,
        tables: Vec<TableSchema>,
    ) -> Harness {
        let cache = Arc::new(crate::cache::store::MemoryCache::new());
        let history = Arc::new(MemoryHistory::new());
        let generator = Arc::new(MockGenerator::returning(generated_sql));
        let executor = Arc::new(MockExecutor {
            result: exec_result,
            calls: AtomicUsize::new(0),
        });
        let quota = Arc::new(MockQuota {
            within: within_quota,
            increments: AtomicUsize::new(0),
        });

        let orchestrator = Orchestrator::new(
            phase,
            LimitsConfig::default(),
            Arc::new(MockCatalog { tables }),
            Arc::clone(&cache) as Arc<dyn QueryCache>,
            Arc::clone(&generator) as Arc<dyn SqlGenerator>,
            Arc::clone(&executor) as Arc<dyn QueryExecutor>,
            Arc::clone(&history) as Arc<dyn HistoryStore>,
            Arc::clone(&quota) as Arc<dyn QuotaService>,
        );

        Harness {
            orchestrator,
            cache,
            history,
            generator,
            executor,
            quota,
        }
    }

    fn harness(phase: Phase, generated_sql: &str) -> Harness {
        harness_with(
            phase,
            generated_sql,
            Ok(sales_rows()),
            true,
            vec![TableSchema {
                name: "sales".to_string(),
                ddl: "CREATE TABLE sales (region VARCHAR, total BIGINT);".to_string(),
                description: None,
            }],
        )
    }

    fn tables() -> Vec<String> {
        vec!["sales".to_string()]
    }

    #[tokio::test]
    async fn strict_happy_path_executes_caches_and_records() {
        let h = harness(Phase::Strict, "SELECT region FROM sales LIMIT 10");

        let outcome = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("generate");

        assert!(outcome.success);
        assert!(!outcome.cache_hit);
        assert_eq!(outcome.attempt_number, 1);
        assert_eq!(outcome.row_count, Some(1));
        assert_eq!(outcome.tokens.input, 900);
        assert!(outcome.cost_usd > 0.0);

        // Cached for next time
        assert_eq!(h.cache.list_by_tenant("t1", 10).await.len(), 1);
        // Recorded in history
        let saved = h.history.get(&outcome.attempt_id).await.expect("get");
        assert!(saved.is_some_and(|a| a.success));
        // Quota bumped once
        assert_eq!(h.quota.increments.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeat_question_hits_cache_without_generation() {
        let h = harness(Phase::Strict, "SELECT region FROM sales LIMIT 10");

        h.orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("first generate");
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);

        // Different case and trailing whitespace still collide
        let outcome = h
            .orchestrator
            .generate("t1", "Show Sales ", &tables())
            .await
            .expect("second generate");

        assert!(outcome.cache_hit);
        assert_eq!(outcome.tokens.input, 0);
        assert_eq!(outcome.cost_usd, 0.0);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
        // Hit count was bumped
        let entries = h.cache.list_by_tenant("t1", 10).await;
        assert_eq!(entries[0].hit_count, 1);
        // Cache hits do not consume quota
        assert_eq!(h.quota.increments.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_tenant_misses_the_cache() {
        let h = harness(Phase::Strict, "SELECT region FROM sales LIMIT 10");

        h.orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("first generate");
        h.orchestrator
            .generate("t2", "show sales", &tables())
            .await
            .expect("second generate");

        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn strict_blocks_unsafe_sql_before_execution() {
        let h = harness(Phase::Strict, "SELECT * FROM sales; DROP TABLE sales;");

        let err = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect_err("should block");

        let attempt_id = match err {
            QueryError::UnsafeSql { attempt_id, issues, .. } => {
                assert!(issues.iter().any(|i| i.contains("Detected injection pattern")));
                assert!(issues.iter().any(|i| i.contains("DROP")));
                attempt_id
            }
            other => panic!("expected UnsafeSql, got {:?}", other),
        };

        // Never executed, never cached
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert!(h.cache.list_by_tenant("t1", 10).await.is_empty());

        // Recorded as a security failure
        let saved = h
            .history
            .get(&attempt_id)
            .await
            .expect("get")
            .expect("recorded");
        assert!(!saved.success);
        assert_eq!(saved.error_kind, Some(ErrorKind::Security));
    }

    #[tokio::test]
    async fn strict_blocks_unauthorized_tables() {
        let h = harness(Phase::Strict, "SELECT * FROM secrets LIMIT 10");

        let err = h
            .orchestrator
            .generate("t1", "show secrets", &tables())
            .await
            .expect_err("should block");

        match err {
            QueryError::UnauthorizedTable { names, attempt_id } => {
                assert_eq!(names, vec!["SECRETS".to_string()]);
                let saved = h
                    .history
                    .get(&attempt_id)
                    .await
                    .expect("get")
                    .expect("recorded");
                assert_eq!(saved.error_kind, Some(ErrorKind::Validation));
            }
            other => panic!("expected UnauthorizedTable, got {:?}", other),
        }
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn demonstrative_surfaces_issues_but_executes() {
        let h = harness(
            Phase::Demonstrative,
            "SELECT * FROM sales UNION SELECT * FROM sales",
        );

        let outcome = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("generate");

        assert!(outcome.success);
        assert!(!outcome.validation.is_safe);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        // Cache is a strict-phase feature
        assert!(h.cache.list_by_tenant("t1", 10).await.is_empty());
    }

    #[tokio::test]
    async fn permissive_skips_cache_and_quota() {
        let h = harness_with(
            Phase::Permissive,
            "SELECT region FROM sales",
            Ok(sales_rows()),
            false, // over quota; permissive never checks
            vec![TableSchema {
                name: "sales".to_string(),
                ddl: "CREATE TABLE sales (region VARCHAR);".to_string(),
                description: None,
            }],
        );

        let outcome = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("generate");

        assert!(outcome.success);
        assert!(h.cache.list_by_tenant("t1", 10).await.is_empty());
    }

    #[tokio::test]
    async fn quota_gate_runs_before_generation() {
        let h = harness_with(
            Phase::Strict,
            "SELECT region FROM sales",
            Ok(sales_rows()),
            false,
            vec![TableSchema {
                name: "sales".to_string(),
                ddl: "CREATE TABLE sales (region VARCHAR);".to_string(),
                description: None,
            }],
        );

        let err = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect_err("should be over quota");
        assert!(matches!(err, QueryError::QuotaExceeded));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_tables_are_reported() {
        let h = harness_with(
            Phase::Strict,
            "SELECT 1 FROM t",
            Ok(sales_rows()),
            true,
            Vec::new(),
        );

        let err = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect_err("no tables");
        assert!(matches!(err, QueryError::TablesNotFound { .. }));
    }

    #[tokio::test]
    async fn execution_failure_is_recorded_not_retried() {
        let h = harness_with(
            Phase::Strict,
            "SELECT regio FROM sales LIMIT 10",
            Err("Binder Error: column \"regio\" not found".to_string()),
            true,
            vec![TableSchema {
                name: "sales".to_string(),
                ddl: "CREATE TABLE sales (region VARCHAR);".to_string(),
                description: None,
            }],
        );

        let outcome = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("outcome even on failure");

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Execution));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        // Failed executions are never cached
        assert!(h.cache.list_by_tenant("t1", 10).await.is_empty());
        // But they are recorded for refinement
        let saved = h
            .history
            .get(&outcome.attempt_id)
            .await
            .expect("get")
            .expect("recorded");
        assert!(!saved.success);
    }

    #[tokio::test]
    async fn generation_failure_propagates_loudly() {
        let mut h = harness(Phase::Strict, "unused");
        h.generator = Arc::new(MockGenerator {
            sql: String::new(),
            fail: true,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        });
        // Rebuild the orchestrator around the failing generator
        h.orchestrator = Orchestrator::new(
            Phase::Strict,
            LimitsConfig::default(),
            Arc::new(MockCatalog {
                tables: vec![TableSchema {
                    name: "sales".to_string(),
                    ddl: "CREATE TABLE sales (region VARCHAR);".to_string(),
                    description: None,
                }],
            }),
            Arc::clone(&h.cache) as Arc<dyn QueryCache>,
            Arc::clone(&h.generator) as Arc<dyn SqlGenerator>,
            Arc::clone(&h.executor) as Arc<dyn QueryExecutor>,
            Arc::clone(&h.history) as Arc<dyn HistoryStore>,
            Arc::clone(&h.quota) as Arc<dyn QuotaService>,
        );

        let err = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect_err("generation fails");
        assert!(matches!(err, QueryError::Generation(_)));
    }

    #[tokio::test]
    async fn refine_builds_lineage_and_passes_context() {
        let h = harness_with(
            Phase::Strict,
            "SELECT regio FROM sales LIMIT 10",
            Err("Binder Error: column \"regio\" not found".to_string()),
            true,
            vec![TableSchema {
                name: "sales".to_string(),
                ddl: "CREATE TABLE sales (region VARCHAR);".to_string(),
                description: None,
            }],
        );

        let failed = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("failed outcome");
        assert!(!failed.success);

        let refined = h
            .orchestrator
            .refine("t1", &failed.attempt_id, Some("the column is region"))
            .await
            .expect("refined outcome");

        assert_eq!(refined.attempt_number, 2);
        assert_eq!(refined.parent_attempt_id.as_deref(), Some(failed.attempt_id.as_str()));

        // The generator saw the parent's SQL, error and the user note
        let request = h.generator.last_request.lock().await;
        let previous = request
            .as_ref()
            .and_then(|r| r.previous_attempt.as_ref())
            .expect("refinement context");
        assert_eq!(previous.previous_sql, "SELECT regio FROM sales LIMIT 10");
        assert!(previous
            .previous_error
            .as_deref()
            .is_some_and(|e| e.contains("regio")));
        assert_eq!(previous.user_note.as_deref(), Some("the column is region"));
    }

    #[tokio::test]
    async fn refining_foreign_attempt_is_denied_without_a_record() {
        let h = harness(Phase::Strict, "SELECT region FROM sales LIMIT 10");

        let outcome = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("generate");

        let err = h
            .orchestrator
            .refine("t2", &outcome.attempt_id, None)
            .await
            .expect_err("denied");
        assert!(matches!(err, QueryError::AccessDenied));
        // Only the original attempt exists
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn feedback_round_trip_and_validation() {
        let h = harness(Phase::Strict, "SELECT region FROM sales LIMIT 10");
        let outcome = h
            .orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("generate");

        let good = Feedback {
            rating: Some(4),
            kind: Some(FeedbackKind::ThumbsUp),
            text: Some("looks right".to_string()),
        };
        h.orchestrator
            .feedback("t1", &outcome.attempt_id, &good)
            .await
            .expect("feedback saved");

        let saved = h
            .orchestrator
            .attempt("t1", &outcome.attempt_id)
            .await
            .expect("attempt");
        assert_eq!(saved.feedback.as_ref().and_then(|f| f.rating), Some(4));

        let bad_rating = Feedback {
            rating: Some(9),
            kind: None,
            text: None,
        };
        let err = h
            .orchestrator
            .feedback("t1", &outcome.attempt_id, &bad_rating)
            .await
            .expect_err("invalid rating");
        assert!(matches!(err, QueryError::InvalidFeedback(_)));

        let err = h
            .orchestrator
            .feedback("t2", &outcome.attempt_id, &good)
            .await
            .expect_err("foreign tenant");
        assert!(matches!(err, QueryError::AccessDenied));
    }

    #[tokio::test]
    async fn cache_stats_and_bulk_invalidation() {
        let h = harness(Phase::Strict, "SELECT region FROM sales LIMIT 10");

        h.orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("first");
        h.orchestrator
            .generate("t1", "show sales", &tables())
            .await
            .expect("hit");

        let stats = h.orchestrator.cache_stats("t1").await;
        assert_eq!(stats.total_cached_queries, 1);
        assert_eq!(stats.total_cache_hits, 1);
        assert_eq!(stats.most_popular_queries.len(), 1);

        assert_eq!(h.orchestrator.invalidate_cache("t1").await, 1);
        let stats = h.orchestrator.cache_stats("t1").await;
        assert_eq!(stats.total_cached_queries, 0);
    }

    #[test]
    fn unauthorized_names_parse_back_out() {
        let errors = vec![
            "SQL injection attempt detected".to_string(),
            "Unauthorized table reference(s): SECRETS, VAULT".to_string(),
        ];
        assert_eq!(
            unauthorized_names(&errors),
            vec!["SECRETS".to_string(), "VAULT".to_string()]
        );
        assert!(unauthorized_names(&["nothing here".to_string()]).is_empty());
    }
}
