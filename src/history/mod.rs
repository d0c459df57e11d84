//! Query attempt audit trail.

pub mod duckdb;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ErrorKind;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    ThumbsUp,
    ThumbsDown,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::ThumbsUp => "thumbs_up",
            FeedbackKind::ThumbsDown => "thumbs_down",
        }
    }

    pub fn parse(s: &str) -> Option<FeedbackKind> {
        match s {
            "thumbs_up" => Some(FeedbackKind::ThumbsUp),
            "thumbs_down" => Some(FeedbackKind::ThumbsDown),
            _ => None,
        }
    }
}

/// User feedback on an attempt. Applied last-write-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: Option<u8>,
    pub kind: Option<FeedbackKind>,
    pub text: Option<String>,
}

impl Feedback {
    /// Rating must sit in 1-5 when present.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(rating) = self.rating {
            if !(1..=5).contains(&rating) {
                return Err("Rating must be between 1 and 5".to_string());
            }
        }
        Ok(())
    }
}

/// One generation/execution round, immutable once written except for the
/// feedback update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAttempt {
    pub id: String,
    pub tenant: String,
    pub parent_id: Option<String>,
    /// 1-based; a child is always parent + 1.
    pub attempt_number: u32,
    pub question: String,
    pub tables: Vec<String>,
    pub sql: String,
    pub explanation: String,
    pub success: bool,
    pub rows_returned: Option<usize>,
    pub execution_time_ms: Option<u64>,
    pub cache_hit: bool,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub syntax_valid: bool,
    pub security_passed: bool,
    pub complexity_score: u8,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub user_note: Option<String>,
    pub feedback: Option<Feedback>,
    pub created_at: DateTime<Utc>,
}

/// Persistence for attempts. Save failures on the request path are logged
/// and absorbed by the caller, never surfaced.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save(&self, attempt: &QueryAttempt) -> Result<(), BoxError>;
    async fn get(&self, id: &str) -> Result<Option<QueryAttempt>, BoxError>;
    async fn update_feedback(&self, id: &str, feedback: &Feedback) -> Result<(), BoxError>;
}

/// In-process store, used in tests and as a fallback when no system
/// database is configured.
pub struct MemoryHistory {
    attempts: RwLock<HashMap<String, QueryAttempt>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self {
            attempts: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn save(&self, attempt: &QueryAttempt) -> Result<(), BoxError> {
        let mut attempts = self.attempts.write().await;
        attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<QueryAttempt>, BoxError> {
        let attempts = self.attempts.read().await;
        Ok(attempts.get(id).cloned())
    }

    async fn update_feedback(&self, id: &str, feedback: &Feedback) -> Result<(), BoxError> {
        let mut attempts = self.attempts.write().await;
        match attempts.get_mut(id) {
            Some(attempt) => {
                attempt.feedback = Some(feedback.clone());
                Ok(())
            }
            None => Err(format!("Attempt not found: {}", id).into()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_attempt(id: &str, tenant: &str) -> QueryAttempt {
    QueryAttempt {
        id: id.to_string(),
        tenant: tenant.to_string(),
        parent_id: None,
        attempt_number: 1,
        question: "show sales".to_string(),
        tables: vec!["sales".to_string()],
        sql: "SELECT * FROM sales LIMIT 10".to_string(),
        explanation: "first ten sales rows".to_string(),
        success: true,
        rows_returned: Some(10),
        execution_time_ms: Some(12),
        cache_hit: false,
        error_message: None,
        error_kind: None,
        syntax_valid: true,
        security_passed: true,
        complexity_score: 1,
        input_tokens: 100,
        output_tokens: 40,
        estimated_cost_usd: 0.0009,
        user_note: None,
        feedback: None,
        created_at: Utc::now(),
    }
}
