//! DuckDB-backed history store over the system database.

use async_trait::async_trait;
use chrono::Utc;
use duckdb::types::ToSql;
use r2d2::Pool;

use crate::db::pool::DuckDbConnectionManager;
use crate::db::util::execute_stmt;
use crate::error::ErrorKind;

use super::{Feedback, FeedbackKind, HistoryStore, QueryAttempt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct DuckDbHistory {
    pool: Pool<DuckDbConnectionManager>,
}

impl DuckDbHistory {
    pub fn new(pool: Pool<DuckDbConnectionManager>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for DuckDbHistory {
    async fn save(&self, attempt: &QueryAttempt) -> Result<(), BoxError> {
        let pool = self.pool.clone();
        let attempt = attempt.clone();

        tokio::task::spawn_blocking(move || -> Result<(), BoxError> {
            let conn = pool.get()?;

            let mut stmt = conn.prepare(
                "INSERT INTO query_history (
                    query_id, tenant_id, parent_query_id, attempt_number,
                    natural_language_query, selected_tables, generated_sql, sql_explanation,
                    execution_time_ms, rows_returned, cache_hit, success,
                    error_message, error_type,
                    sql_syntax_valid, security_check_passed, query_complexity_score,
                    input_tokens, output_tokens, estimated_cost_usd,
                    user_refinement, user_rating, user_feedback_type, user_feedback_text,
                    feedback_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            let tables_json = serde_json::to_string(&attempt.tables)?;
            let attempt_number = attempt.attempt_number as i64;
            let execution_time_ms = attempt.execution_time_ms.map(|v| v as i64);
            let rows_returned = attempt.rows_returned.map(|v| v as i64);
            let error_type = attempt.error_kind.map(|k| k.as_str());
            let complexity = attempt.complexity_score as i64;
            let input_tokens = attempt.input_tokens as i64;
            let output_tokens = attempt.output_tokens as i64;
            let rating = attempt
                .feedback
                .as_ref()
                .and_then(|f| f.rating)
                .map(|r| r as i64);
            let feedback_type = attempt
                .feedback
                .as_ref()
                .and_then(|f| f.kind)
                .map(|k| k.as_str());
            let feedback_text = attempt.feedback.as_ref().and_then(|f| f.text.clone());
            let feedback_at: Option<i64> = None;
            let created_at = attempt.created_at.timestamp();

            let params: Vec<&(dyn ToSql + Sync)> = vec![
                &attempt.id,
                &attempt.tenant,
                &attempt.parent_id,
                &attempt_number,
                &attempt.question,
                &tables_json,
                &attempt.sql,
                &attempt.explanation,
                &execution_time_ms,
                &rows_returned,
                &attempt.cache_hit,
                &attempt.success,
                &attempt.error_message,
                &error_type,
                &attempt.syntax_valid,
                &attempt.security_passed,
                &complexity,
                &input_tokens,
                &output_tokens,
                &attempt.estimated_cost_usd,
                &attempt.user_note,
                &rating,
                &feedback_type,
                &feedback_text,
                &feedback_at,
                &created_at,
            ];

            execute_stmt(&mut stmt, &params)?;
            Ok(())
        })
        .await??;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<QueryAttempt>, BoxError> {
        let pool = self.pool.clone();
        let id = id.to_string();

        let attempt = tokio::task::spawn_blocking(move || -> Result<Option<QueryAttempt>, BoxError> {
            let conn = pool.get()?;

            let mut stmt = conn.prepare(
                "SELECT query_id, tenant_id, parent_query_id, attempt_number,
                        natural_language_query, selected_tables, generated_sql, sql_explanation,
                        execution_time_ms, rows_returned, cache_hit, success,
                        error_message, error_type,
                        sql_syntax_valid, security_check_passed, query_complexity_score,
                        input_tokens, output_tokens, estimated_cost_usd,
                        user_refinement, user_rating, user_feedback_type, user_feedback_text,
                        created_at
                 FROM query_history WHERE query_id = ?",
            )?;

            let mut rows = stmt.query([&id])?;
            let row = match rows.next()? {
                Some(row) => row,
                None => return Ok(None),
            };

            let tables_json: String = row.get(5)?;
            let tables: Vec<String> = serde_json::from_str(&tables_json).unwrap_or_default();

            let error_type: Option<String> = row.get(13)?;
            let rating: Option<i64> = row.get(21)?;
            let feedback_type: Option<String> = row.get(22)?;
            let feedback_text: Option<String> = row.get(23)?;

            let feedback = if rating.is_some() || feedback_type.is_some() || feedback_text.is_some()
            {
                Some(Feedback {
                    rating: rating.map(|r| r as u8),
                    kind: feedback_type.as_deref().and_then(FeedbackKind::parse),
                    text: feedback_text,
                })
            } else {
                None
            };

            let execution_time_ms: Option<i64> = row.get(8)?;
            let rows_returned: Option<i64> = row.get(9)?;
            let attempt_number: i64 = row.get(3)?;
            let complexity: i64 = row.get(16)?;
            let input_tokens: i64 = row.get(17)?;
            let output_tokens: i64 = row.get(18)?;
            let created_at: i64 = row.get(24)?;

            Ok(Some(QueryAttempt {
                id: row.get(0)?,
                tenant: row.get(1)?,
                parent_id: row.get(2)?,
                attempt_number: attempt_number as u32,
                question: row.get(4)?,
                tables,
                sql: row.get(6)?,
                explanation: row.get(7)?,
                success: row.get(11)?,
                rows_returned: rows_returned.map(|v| v as usize),
                execution_time_ms: execution_time_ms.map(|v| v as u64),
                cache_hit: row.get(10)?,
                error_message: row.get(12)?,
                error_kind: error_type.as_deref().and_then(ErrorKind::parse),
                syntax_valid: row.get(14)?,
                security_passed: row.get(15)?,
                complexity_score: complexity as u8,
                input_tokens: input_tokens as u64,
                output_tokens: output_tokens as u64,
                estimated_cost_usd: row.get(19)?,
                user_note: row.get(20)?,
                feedback,
                created_at: chrono::DateTime::from_timestamp(created_at, 0)
                    .unwrap_or_else(Utc::now),
            }))
        })
        .await??;

        Ok(attempt)
    }

    async fn update_feedback(&self, id: &str, feedback: &Feedback) -> Result<(), BoxError> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let feedback = feedback.clone();

        tokio::task::spawn_blocking(move || -> Result<(), BoxError> {
            let conn = pool.get()?;

            let rating = feedback.rating.map(|r| r as i64);
            let kind = feedback.kind.map(|k| k.as_str());
            let now = Utc::now().timestamp();

            let updated = conn.execute(
                "UPDATE query_history
                 SET user_rating = ?, user_feedback_type = ?, user_feedback_text = ?, feedback_at = ?
                 WHERE query_id = ?",
                duckdb::params![rating, kind, feedback.text, now, id],
            )?;

            if updated == 0 {
                return Err(format!("Attempt not found: {}", id).into());
            }
            Ok(())
        })
        .await??;

        Ok(())
    }
}
