//! Out-of-process job worker.
//!
//! Accepts prepared job work dirs over HTTP, runs their command with stdout
//! and stderr redirected to the requested files, and reports status until
//! the conductor collects the result.

pub mod handlers;
pub mod middleware;
pub mod services;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use services::JobManager;

pub struct AppState {
    pub api_key: String,
    pub jobs: JobManager,
}

impl AppState {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            jobs: JobManager::new(),
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/cleanup", post(handlers::cleanup_jobs))
        .route("/jobs/{job_id}", get(handlers::get_job))
        .route("/jobs/{job_id}/terminate", post(handlers::terminate_job))
        .route("/jobs/{job_id}/logs", get(handlers::get_logs))
        .with_state(state)
}
