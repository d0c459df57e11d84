use crate::config::AppConfig;
use crate::db::system::SystemStore;
use crate::error::QueryError;
use crate::pipeline::Orchestrator;

/// Shared application state for the web server.
pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: Orchestrator,
    pub system: SystemStore,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Orchestrator, system: SystemStore) -> Self {
        Self {
            config,
            orchestrator,
            system,
            startup_time: chrono::Utc::now(),
        }
    }

    /// Requests that name no tenant fall back to the seeded default.
    pub async fn resolve_tenant(&self, requested: Option<&str>) -> Result<String, QueryError> {
        match requested {
            Some(tenant) if !tenant.is_empty() => Ok(tenant.to_string()),
            _ => self
                .system
                .default_tenant()
                .await
                .map_err(|e| QueryError::Internal(e.to_string())),
        }
    }
}
