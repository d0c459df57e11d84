//! System database bootstrap and rarely-changing lookups.

use std::sync::OnceLock;

use r2d2::Pool;
use tracing::info;

use super::pool::DuckDbConnectionManager;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_TENANT_NAME: &str = "Demo Tenant";
const DEFAULT_TENANT_ID: &str = "demo";
const DEFAULT_QUERY_LIMIT: i64 = 1000;

/// Owns the shared system database: tenants and query history live here.
pub struct SystemStore {
    pool: Pool<DuckDbConnectionManager>,
    // Resolved once and reused; recomputation under races is idempotent
    // and cheap, so no locking beyond the cell itself.
    default_tenant: OnceLock<String>,
}

impl SystemStore {
    pub fn new(pool: Pool<DuckDbConnectionManager>) -> Self {
        Self {
            pool,
            default_tenant: OnceLock::new(),
        }
    }

    /// Create system tables when missing and seed the demo tenant.
    pub async fn bootstrap(&self) -> Result<(), BoxError> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || -> Result<(), BoxError> {
            let conn = pool.get()?;

            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS tenants (
                    tenant_id VARCHAR PRIMARY KEY,
                    tenant_name VARCHAR NOT NULL,
                    monthly_query_count BIGINT NOT NULL DEFAULT 0,
                    query_limit BIGINT NOT NULL DEFAULT 1000,
                    is_active BOOLEAN NOT NULL DEFAULT true
                );
                CREATE TABLE IF NOT EXISTS query_history (
                    query_id VARCHAR PRIMARY KEY,
                    tenant_id VARCHAR NOT NULL,
                    parent_query_id VARCHAR,
                    attempt_number INTEGER NOT NULL,
                    natural_language_query VARCHAR NOT NULL,
                    selected_tables VARCHAR NOT NULL,
                    generated_sql VARCHAR,
                    sql_explanation VARCHAR,
                    execution_time_ms BIGINT,
                    rows_returned BIGINT,
                    cache_hit BOOLEAN NOT NULL,
                    success BOOLEAN NOT NULL,
                    error_message VARCHAR,
                    error_type VARCHAR,
                    sql_syntax_valid BOOLEAN NOT NULL,
                    security_check_passed BOOLEAN NOT NULL,
                    query_complexity_score INTEGER NOT NULL,
                    input_tokens BIGINT NOT NULL,
                    output_tokens BIGINT NOT NULL,
                    estimated_cost_usd DOUBLE NOT NULL,
                    user_refinement VARCHAR,
                    user_rating INTEGER,
                    user_feedback_type VARCHAR,
                    user_feedback_text VARCHAR,
                    feedback_at BIGINT,
                    created_at BIGINT NOT NULL
                );",
            )?;

            // Seed the demo tenant on first start
            let mut stmt =
                conn.prepare("SELECT COUNT(*) FROM tenants WHERE tenant_name = ?")?;
            let existing: i64 = stmt.query_row([DEFAULT_TENANT_NAME], |row| row.get(0))?;

            if existing == 0 {
                info!("Seeding default tenant '{}'", DEFAULT_TENANT_NAME);
                conn.execute(
                    "INSERT INTO tenants (tenant_id, tenant_name, monthly_query_count, query_limit, is_active)
                     VALUES (?, ?, 0, ?, true)",
                    duckdb::params![DEFAULT_TENANT_ID, DEFAULT_TENANT_NAME, DEFAULT_QUERY_LIMIT],
                )?;
            }

            Ok(())
        })
        .await??;

        Ok(())
    }

    /// Tenant used when a request names none. Resolved from the database
    /// once per process.
    pub async fn default_tenant(&self) -> Result<String, BoxError> {
        if let Some(id) = self.default_tenant.get() {
            return Ok(id.clone());
        }

        let pool = self.pool.clone();
        let id = tokio::task::spawn_blocking(move || -> Result<String, BoxError> {
            let conn = pool.get()?;
            let mut stmt = conn
                .prepare("SELECT tenant_id FROM tenants WHERE tenant_name = ? LIMIT 1")?;
            let id: String = stmt.query_row([DEFAULT_TENANT_NAME], |row| row.get(0))?;
            Ok(id)
        })
        .await??;

        // A racing resolver may have set it first; both computed the same value.
        let _ = self.default_tenant.set(id.clone());
        Ok(id)
    }
}
