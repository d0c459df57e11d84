use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Query pipeline
            .route("/query/generate", post(handlers::api::generate_query))
            .route("/query/refine", post(handlers::api::refine_query))
            .route("/query/feedback", post(handlers::api::submit_feedback))
            .route("/query/{id}", get(handlers::api::get_attempt))
            // Cache management
            .route("/cache/stats", get(handlers::api::cache_stats))
            .route("/cache", delete(handlers::api::clear_cache))
            // Schema inspection
            .route("/schema", get(handlers::api::get_schema))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
