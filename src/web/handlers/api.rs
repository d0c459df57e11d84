use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::error::QueryError;
use crate::history::{Feedback, FeedbackKind, QueryAttempt};
use crate::pipeline::QueryOutcome;
use crate::web::state::AppState;

// Request types

#[derive(Debug, Deserialize)]
pub struct GenerateQueryRequest {
    pub question: String,
    pub tables: Vec<String>,
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefineQueryRequest {
    pub parent_attempt_id: String,
    pub note: Option<String>,
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub attempt_id: String,
    pub rating: Option<u8>,
    pub kind: Option<String>,
    pub text: Option<String>,
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SchemaQuery {
    pub tenant: Option<String>,
    /// Comma-separated table names.
    pub tables: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub phase: String,
}

type ApiError = (StatusCode, Json<Value>);

/// Map the error taxonomy onto HTTP responses. Blocked queries keep their
/// recorded attempt id in the body so the caller can refine them.
fn error_response(err: QueryError) -> ApiError {
    match err {
        QueryError::QuotaExceeded => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Monthly query limit exceeded",
                "message": "Please contact support to increase your limit"
            })),
        ),
        QueryError::AccessDenied => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Access denied"})),
        ),
        QueryError::UnsafeSql {
            attempt_id,
            sql,
            issues,
        } => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "attempt_id": attempt_id,
                "error": "Query blocked for security reasons",
                "security_issues": issues,
                "generated_sql": sql
            })),
        ),
        QueryError::UnauthorizedTable { attempt_id, names } => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "attempt_id": attempt_id,
                "error": format!("Unauthorized table reference(s): {}", names.join(", "))
            })),
        ),
        QueryError::InvalidSyntax {
            attempt_id,
            message,
        } => (
            StatusCode::BAD_REQUEST,
            Json(json!({"attempt_id": attempt_id, "error": message})),
        ),
        QueryError::TablesNotFound { names } => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "No tables found",
                "message": format!("Tables {} not found in your schema", names.join(", "))
            })),
        ),
        QueryError::AttemptNotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Attempt not found: {}", id)})),
        ),
        QueryError::RefinementDepthExceeded => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Refinement chain depth limit reached"})),
        ),
        QueryError::InvalidFeedback(message) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
        }
        QueryError::Generation(e) => {
            error!("Generation service failure: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("Generation service failure: {}", e)})),
            )
        }
        QueryError::Internal(message) => {
            error!("Internal error: {}", message);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server error"})),
            )
        }
    }
}

fn outcome_response(outcome: QueryOutcome) -> (StatusCode, Json<QueryOutcome>) {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(outcome))
}

// Query generation
pub async fn generate_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GenerateQueryRequest>,
) -> Result<(StatusCode, Json<QueryOutcome>), ApiError> {
    if payload.question.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "question is required"})),
        ));
    }
    if payload.tables.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "tables is required"})),
        ));
    }

    let tenant = state
        .resolve_tenant(payload.tenant.as_deref())
        .await
        .map_err(error_response)?;

    let outcome = state
        .orchestrator
        .generate(&tenant, &payload.question, &payload.tables)
        .await
        .map_err(error_response)?;

    Ok(outcome_response(outcome))
}

// Query refinement
pub async fn refine_query(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RefineQueryRequest>,
) -> Result<(StatusCode, Json<QueryOutcome>), ApiError> {
    let tenant = state
        .resolve_tenant(payload.tenant.as_deref())
        .await
        .map_err(error_response)?;

    let outcome = state
        .orchestrator
        .refine(&tenant, &payload.parent_attempt_id, payload.note.as_deref())
        .await
        .map_err(error_response)?;

    Ok(outcome_response(outcome))
}

// User feedback
pub async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FeedbackRequest>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state
        .resolve_tenant(payload.tenant.as_deref())
        .await
        .map_err(error_response)?;

    let kind = match payload.kind.as_deref() {
        None => None,
        Some(s) => Some(FeedbackKind::parse(s).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Feedback type must be thumbs_up or thumbs_down"})),
            )
        })?),
    };

    let feedback = Feedback {
        rating: payload.rating,
        kind,
        text: payload.text,
    };

    state
        .orchestrator
        .feedback(&tenant, &payload.attempt_id, &feedback)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({
        "message": "Feedback saved successfully",
        "attempt_id": payload.attempt_id
    })))
}

// Attempt lookup
pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<QueryAttempt>, ApiError> {
    let tenant = state
        .resolve_tenant(query.tenant.as_deref())
        .await
        .map_err(error_response)?;

    let attempt = state
        .orchestrator
        .attempt(&tenant, &id)
        .await
        .map_err(error_response)?;

    Ok(Json(attempt))
}

// Cache stats
pub async fn cache_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state
        .resolve_tenant(query.tenant.as_deref())
        .await
        .map_err(error_response)?;

    let stats = state.orchestrator.cache_stats(&tenant).await;
    Ok(Json(json!({"tenant": tenant, "stats": stats})))
}

// Cache invalidation
pub async fn clear_cache(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state
        .resolve_tenant(query.tenant.as_deref())
        .await
        .map_err(error_response)?;

    let deleted = state.orchestrator.invalidate_cache(&tenant).await;
    Ok(Json(json!({"tenant": tenant, "deleted": deleted})))
}

// Schema inspection
pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SchemaQuery>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state
        .resolve_tenant(query.tenant.as_deref())
        .await
        .map_err(error_response)?;

    let tables: Vec<String> = query
        .tables
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if tables.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "tables is required"})),
        ));
    }

    let schema = state
        .orchestrator
        .schema_context(&tenant, &tables)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({"tenant": tenant, "schema": schema})))
}

// System status
pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        phase: state.config.phase.to_string(),
    })
}
