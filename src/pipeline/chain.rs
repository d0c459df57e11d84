//! Attempt lineage: one original query and its user-directed corrections.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::QueryError;
use crate::history::{HistoryStore, QueryAttempt};
use crate::llm::RefinementContext;

/// Builds root and child attempts and enforces chain ownership. Depth is
/// unbounded unless a cap is configured.
pub struct RefinementChain {
    history: Arc<dyn HistoryStore>,
    max_depth: Option<u32>,
}

impl RefinementChain {
    pub fn new(history: Arc<dyn HistoryStore>, max_depth: Option<u32>) -> Self {
        Self { history, max_depth }
    }

    /// Root attempt skeleton: number 1, no parent. The pipeline fills in
    /// generation and execution results before the record is saved.
    pub fn begin(&self, tenant: &str, question: &str, tables: &[String]) -> QueryAttempt {
        QueryAttempt {
            id: Uuid::new_v4().to_string(),
            tenant: tenant.to_string(),
            parent_id: None,
            attempt_number: 1,
            question: question.to_string(),
            tables: tables.to_vec(),
            sql: String::new(),
            explanation: String::new(),
            success: false,
            rows_returned: None,
            execution_time_ms: None,
            cache_hit: false,
            error_message: None,
            error_kind: None,
            syntax_valid: true,
            security_passed: true,
            complexity_score: 1,
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost_usd: 0.0,
            user_note: None,
            feedback: None,
            created_at: Utc::now(),
        }
    }

    /// Child attempt for a failed parent, plus the context handed to the
    /// generator. The tenant gate runs before any record exists, so a
    /// denied refinement leaves no trace in history.
    pub async fn refine(
        &self,
        tenant: &str,
        parent_id: &str,
        user_note: Option<&str>,
    ) -> Result<(QueryAttempt, RefinementContext), QueryError> {
        let parent = self
            .history
            .get(parent_id)
            .await
            .map_err(|e| QueryError::Internal(e.to_string()))?
            .ok_or_else(|| QueryError::AttemptNotFound(parent_id.to_string()))?;

        if parent.tenant != tenant {
            return Err(QueryError::AccessDenied);
        }

        if let Some(max_depth) = self.max_depth {
            if parent.attempt_number >= max_depth {
                return Err(QueryError::RefinementDepthExceeded);
            }
        }

        let context = RefinementContext {
            previous_sql: parent.sql.clone(),
            previous_error: parent.error_message.clone(),
            user_note: user_note.map(|s| s.to_string()),
        };

        let mut child = self.begin(tenant, &parent.question, &parent.tables);
        child.parent_id = Some(parent.id.clone());
        child.attempt_number = parent.attempt_number + 1;
        child.user_note = user_note.map(|s| s.to_string());

        Ok((child, context))
    }
}
