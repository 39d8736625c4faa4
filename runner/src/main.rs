// File: runner/src/main.rs
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use runner::{create_router, AppState};

const DEFAULT_API_KEY: &str = "default-development-key";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive("runner=info".parse()?)
        .add_directive("hyper=warn".parse()?);
    fmt().with_env_filter(env_filter).init();

    let bind = std::env::var("RUNNER_BIND").unwrap_or_else(|_| "0.0.0.0:8745".to_string());
    let api_key = std::env::var("RUNNER_API_KEY").unwrap_or_else(|_| DEFAULT_API_KEY.to_string());
    if api_key == DEFAULT_API_KEY {
        warn!("Using default development API key - set RUNNER_API_KEY environment variable for production");
    }
    let retention_hours: i64 = std::env::var("RUNNER_JOB_RETENTION_HOURS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(24);

    let state = Arc::new(AppState::new(api_key));

    let jobs = state.jobs.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            jobs.cleanup_old_jobs(retention_hours).await;
        }
    });

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Job runner listening on {}", bind);

    axum::serve(listener, app).await?;
    Ok(())
}
