//! Monthly query quota, consulted (not owned) by the pipeline.
//!
//! Check-then-increment is not atomic: two concurrent requests from the
//! same tenant can both pass the check before either increments. Accepted.

use async_trait::async_trait;
use r2d2::Pool;
use tracing::warn;

use crate::db::pool::DuckDbConnectionManager;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait QuotaService: Send + Sync {
    /// False when the tenant is unknown or at its limit.
    async fn within_limit(&self, tenant: &str) -> Result<bool, BoxError>;
    async fn increment(&self, tenant: &str) -> Result<(), BoxError>;
}

pub struct DuckDbQuota {
    pool: Pool<DuckDbConnectionManager>,
}

impl DuckDbQuota {
    pub fn new(pool: Pool<DuckDbConnectionManager>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaService for DuckDbQuota {
    async fn within_limit(&self, tenant: &str) -> Result<bool, BoxError> {
        let pool = self.pool.clone();
        let tenant = tenant.to_string();

        let within = tokio::task::spawn_blocking(move || -> Result<bool, BoxError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT monthly_query_count, query_limit FROM tenants WHERE tenant_id = ?",
            )?;

            let mut rows = stmt.query([&tenant])?;
            match rows.next()? {
                Some(row) => {
                    let count: i64 = row.get(0)?;
                    let limit: i64 = row.get(1)?;
                    Ok(count < limit)
                }
                None => {
                    warn!("Quota check for unknown tenant {}", tenant);
                    Ok(false)
                }
            }
        })
        .await??;

        Ok(within)
    }

    async fn increment(&self, tenant: &str) -> Result<(), BoxError> {
        let pool = self.pool.clone();
        let tenant = tenant.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), BoxError> {
            let conn = pool.get()?;
            conn.execute(
                "UPDATE tenants SET monthly_query_count = monthly_query_count + 1 WHERE tenant_id = ?",
                [&tenant],
            )?;
            Ok(())
        })
        .await??;

        Ok(())
    }
}
