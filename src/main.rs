use clap::Parser;
use r2d2::Pool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod cache;
mod config;
mod db;
mod error;
mod exec;
mod history;
mod llm;
mod pipeline;
mod quota;
mod schema;
mod util;
mod validate;
mod web;

use crate::cache::store::MemoryCache;
use crate::config::{AppConfig, CliArgs};
use crate::db::pool::DuckDbConnectionManager;
use crate::db::system::SystemStore;
use crate::exec::duckdb::DuckDbExecutor;
use crate::history::duckdb::DuckDbHistory;
use crate::llm::LlmManager;
use crate::pipeline::Orchestrator;
use crate::quota::DuckDbQuota;
use crate::schema::catalog::DuckDbCatalog;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Ensure data directory exists
    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    info!("Initializing system database pool");
    let manager = DuckDbConnectionManager::new(config.database.connection_string.clone());
    let pool = Pool::builder()
        .max_size(config.database.pool_size as u32)
        .build(manager)?;

    // Create system tables and seed the default tenant
    let system = SystemStore::new(pool.clone());
    system.bootstrap().await?;

    // Initialize the generation backend
    info!("Initializing LLM backend: {}", config.llm.backend);
    let llm_manager = LlmManager::new(&config.llm)?;

    // Wire the pipeline; every collaborator is owned here and handed in
    let orchestrator = Orchestrator::new(
        config.phase,
        config.limits.clone(),
        Arc::new(DuckDbCatalog::new(data_dir.clone())),
        Arc::new(MemoryCache::new()),
        Arc::new(llm_manager),
        Arc::new(DuckDbExecutor::new(data_dir.clone())),
        Arc::new(DuckDbHistory::new(pool.clone())),
        Arc::new(DuckDbQuota::new(pool)),
    );

    let app_state = Arc::new(AppState::new(config.clone(), orchestrator, system));

    // Start the web server
    info!(
        "Starting nl-query server on {}:{} [phase: {}]",
        config.web.host, config.web.port, config.phase
    );
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(std::io::Error::other(e.to_string()).into());
        }
    }

    Ok(())
}
