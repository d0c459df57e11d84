//! Bounded query execution.

pub mod duckdb;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use crate::config::Phase;
use crate::error::ErrorKind;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Raw result set from the driver, before any guard limits apply.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
}

/// Executes SQL against a tenant's database. Implementations surface raw
/// driver errors as text; classification happens in the guard.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, tenant: &str, sql: &str) -> Result<ResultSet, BoxError>;
}

/// Execution failure with the coarse category recorded into history.
#[derive(Debug, Clone)]
pub struct ExecFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Guarded execution outcome.
#[derive(Debug, Clone)]
pub struct GuardedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub truncated: bool,
}

/// Wraps the raw executor with a strict-phase statement timeout, a hard
/// row cap and textual error classification.
///
/// The timeout does not cancel work already running on the driver side;
/// once execution begins the caller cannot abort it early.
pub struct ExecutionGuard {
    executor: Arc<dyn QueryExecutor>,
    statement_timeout: Duration,
    max_rows: usize,
}

impl ExecutionGuard {
    pub fn new(executor: Arc<dyn QueryExecutor>, statement_timeout: Duration, max_rows: usize) -> Self {
        Self {
            executor,
            statement_timeout,
            max_rows,
        }
    }

    pub async fn run(&self, tenant: &str, sql: &str, phase: Phase) -> Result<GuardedResult, ExecFailure> {
        let outcome = if phase == Phase::Strict {
            match tokio::time::timeout(self.statement_timeout, self.executor.execute(tenant, sql))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        "Statement timeout after {}s for tenant {}",
                        self.statement_timeout.as_secs(),
                        tenant
                    );
                    return Err(ExecFailure {
                        kind: ErrorKind::Timeout,
                        message: "canceling statement due to statement timeout".to_string(),
                    });
                }
            }
        } else {
            // Other phases accept unbounded blocking
            self.executor.execute(tenant, sql).await
        };

        match outcome {
            Ok(result) => {
                let mut rows = result.rows;
                let mut truncated = false;

                if phase == Phase::Strict && rows.len() > self.max_rows {
                    warn!(
                        "Query returned {} rows, truncating to {}",
                        rows.len(),
                        self.max_rows
                    );
                    rows.truncate(self.max_rows);
                    truncated = true;
                }

                let row_count = rows.len();
                Ok(GuardedResult {
                    columns: result.columns,
                    rows,
                    row_count,
                    truncated,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!("Query execution error: {}", message);
                Err(ExecFailure {
                    kind: classify_execution_error(&message),
                    message,
                })
            }
        }
    }
}

/// Textual heuristic over driver error messages. The taxonomy and the
/// substring rules are a compatibility contract; unfamiliar engines may
/// classify imperfectly and that is accepted.
pub fn classify_execution_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("syntax error") {
        ErrorKind::Syntax
    } else if lower.contains("timeout") || lower.contains("canceling statement") {
        ErrorKind::Timeout
    } else {
        ErrorKind::Execution
    }
}
