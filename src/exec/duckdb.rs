//! DuckDB-backed executor over per-tenant database files.

use std::path::PathBuf;

use async_trait::async_trait;
use duckdb::types::ValueRef;
use duckdb::Connection;
use serde_json::{Map, Value};
use tracing::debug;

use super::{QueryExecutor, ResultSet};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Runs SQL against `data_dir/<tenant>/<tenant>.duckdb`. All driver work
/// happens on the blocking pool; DuckDB connections are not Sync.
pub struct DuckDbExecutor {
    data_dir: PathBuf,
}

impl DuckDbExecutor {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn tenant_db_path(&self, tenant: &str) -> PathBuf {
        self.data_dir
            .join(tenant)
            .join(format!("{}.duckdb", tenant))
    }
}

#[async_trait]
impl QueryExecutor for DuckDbExecutor {
    async fn execute(&self, tenant: &str, sql: &str) -> Result<ResultSet, BoxError> {
        let db_path = self.tenant_db_path(tenant);

        if !db_path.exists() {
            return Err(format!("No database found for tenant at {}", db_path.display()).into());
        }

        let sql = sql.to_string();

        let result = tokio::task::spawn_blocking(move || -> Result<ResultSet, BoxError> {
            let conn = Connection::open(&db_path)?;
            let mut stmt = conn.prepare(&sql)?;

            let column_count = stmt.column_count();
            let mut columns = Vec::with_capacity(column_count);
            for i in 0..column_count {
                if let Ok(name) = stmt.column_name(i) {
                    columns.push(name.to_string());
                }
            }

            let mut out_rows = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut object = Map::with_capacity(column_count);
                for (i, column) in columns.iter().enumerate() {
                    object.insert(column.clone(), value_to_json(row, i));
                }
                out_rows.push(Value::Object(object));
            }

            debug!("Query returned {} rows", out_rows.len());

            Ok(ResultSet {
                columns,
                rows: out_rows,
            })
        })
        .await??;

        Ok(result)
    }
}

/// Convert one cell into JSON. Uncommon types fall back to their string
/// rendering rather than failing the whole result.
fn value_to_json(row: &duckdb::Row<'_>, i: usize) -> Value {
    match row.get_ref(i) {
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Boolean(b)) => Value::Bool(b),
        Ok(ValueRef::TinyInt(v)) => Value::from(v),
        Ok(ValueRef::SmallInt(v)) => Value::from(v),
        Ok(ValueRef::Int(v)) => Value::from(v),
        Ok(ValueRef::BigInt(v)) => Value::from(v),
        Ok(ValueRef::UTinyInt(v)) => Value::from(v),
        Ok(ValueRef::USmallInt(v)) => Value::from(v),
        Ok(ValueRef::UInt(v)) => Value::from(v),
        Ok(ValueRef::UBigInt(v)) => Value::from(v),
        Ok(ValueRef::Float(v)) => Value::from(v),
        Ok(ValueRef::Double(v)) => Value::from(v),
        _ => row
            .get::<_, String>(i)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
