// File: conductor/src/web/server.rs
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::web::{handlers, AppState};

pub async fn start_web_server(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server running on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/plugin/{job_id}", post(handlers::plugin_call))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
