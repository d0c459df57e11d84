pub mod handlers;
pub mod routes;
pub mod state;

use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::WebConfig;
use state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn run_server(config: WebConfig, state: Arc<AppState>) -> Result<(), BoxError> {
    let app = routes::api_routes()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
