use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// Category recorded against a failed attempt in query history. Execution
/// failures are classified into the syntax/execution/timeout subset by
/// textual heuristics in the execution guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Syntax,
    Execution,
    Timeout,
    Security,
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Security => "security",
            ErrorKind::Validation => "validation",
        }
    }

    pub fn parse(s: &str) -> Option<ErrorKind> {
        match s {
            "syntax" => Some(ErrorKind::Syntax),
            "execution" => Some(ErrorKind::Execution),
            "timeout" => Some(ErrorKind::Timeout),
            "security" => Some(ErrorKind::Security),
            "validation" => Some(ErrorKind::Validation),
            _ => None,
        }
    }
}

/// Everything that can stop a query request, refinement or feedback update.
///
/// Blocked-query variants carry the recorded attempt id so the caller can
/// refine a blocked attempt the same way as a failed execution.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{message}")]
    InvalidSyntax { attempt_id: String, message: String },

    #[error("Query blocked for security reasons")]
    UnsafeSql {
        attempt_id: String,
        sql: String,
        issues: Vec<String>,
    },

    #[error("Unauthorized table reference(s): {}", names.join(", "))]
    UnauthorizedTable {
        attempt_id: String,
        names: Vec<String>,
    },

    #[error("Tables not found: {}", names.join(", "))]
    TablesNotFound { names: Vec<String> },

    #[error("Monthly query limit exceeded")]
    QuotaExceeded,

    #[error("Access denied")]
    AccessDenied,

    #[error("Refinement chain depth limit reached")]
    RefinementDepthExceeded,

    #[error("Attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("{0}")]
    InvalidFeedback(String),

    #[error("Generation service failure: {0}")]
    Generation(#[from] LlmError),

    #[error("Internal error: {0}")]
    Internal(String),
}
