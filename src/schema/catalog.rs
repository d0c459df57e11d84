//! Table DDL retrieval for a tenant database.

use std::path::PathBuf;

use async_trait::async_trait;
use duckdb::Connection;
use tracing::{debug, warn};

use super::TableSchema;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Source of table definitions for a tenant. Tables that do not exist are
/// simply not returned; the caller decides whether an empty result is fatal.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    async fn ddl_for(
        &self,
        tenant: &str,
        table_names: &[String],
    ) -> Result<Vec<TableSchema>, BoxError>;
}

/// Catalog backed by the tenant's DuckDB file under
/// `data_dir/<tenant>/<tenant>.duckdb`, synthesizing CREATE TABLE DDL
/// from information_schema.
pub struct DuckDbCatalog {
    data_dir: PathBuf,
}

impl DuckDbCatalog {
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
impl TableCatalog for DuckDbCatalog {
    async fn ddl_for(
        &self,
        tenant: &str,
        table_names: &[String],
    ) -> Result<Vec<TableSchema>, BoxError> {
        let db_path = self.tenant_db_path(tenant);

        if !db_path.exists() {
            warn!("No database found for tenant {}", tenant);
            return Ok(Vec::new());
        }

        let requested: Vec<String> = table_names.to_vec();

        // DuckDB connections are not Sync; do the whole walk in a blocking task
        let tables = tokio::task::spawn_blocking(move || -> Result<Vec<TableSchema>, BoxError> {
            let conn = Connection::open(&db_path)?;

            // Which of the requested tables actually exist
            let mut stmt = conn.prepare(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = 'main'",
            )?;
            let existing_iter = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let existing: Vec<String> = existing_iter.filter_map(Result::ok).collect();

            let mut selected: Vec<String> = existing
                .into_iter()
                .filter(|name| requested.iter().any(|r| r == name))
                .collect();
            selected.sort();

            let mut tables = Vec::new();

            for table_name in &selected {
                // Column info
                let mut columns_stmt = conn.prepare(
                    "SELECT column_name, data_type, is_nullable
                     FROM information_schema.columns
                     WHERE table_schema = 'main' AND table_name = ?
                     ORDER BY ordinal_position",
                )?;
                let columns_iter = columns_stmt.query_map([table_name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,          // column_name
                        row.get::<_, String>(1)?,          // data_type
                        row.get::<_, String>(2)? == "YES", // is_nullable
                    ))
                })?;
                let columns: Vec<(String, String, bool)> =
                    columns_iter.filter_map(Result::ok).collect();

                if columns.is_empty() {
                    continue;
                }

                // Generate column definitions
                let mut create_table = format!("CREATE TABLE {} (\n", table_name);
                for (i, (name, data_type, nullable)) in columns.iter().enumerate() {
                    let null_str = if *nullable { "" } else { " NOT NULL" };
                    create_table.push_str(&format!("    {} {}{}", name, data_type, null_str));
                    if i < columns.len() - 1 {
                        create_table.push_str(",\n");
                    } else {
                        create_table.push('\n');
                    }
                }
                create_table.push_str(");");

                debug!("Built DDL for table {}", table_name);

                tables.push(TableSchema {
                    name: table_name.clone(),
                    ddl: create_table,
                    description: None,
                });
            }

            Ok(tables)
        })
        .await??;

        Ok(tables)
    }
}
