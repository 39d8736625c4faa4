// Liveness probe

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use super::common::{error_response, ApiResponse, ApiResult};
use crate::database::TaskStatus;
use crate::web::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub running_tasks: usize,
    pub created_tasks: usize,
}

pub async fn health(State(state): State<AppState>) -> ApiResult<HealthReport> {
    let created = state
        .database
        .list_tasks_by_status(TaskStatus::Created)
        .await
        .map_err(error_response)?;
    let running = state.scheduler.running_tasks().await;
    Ok(Json(ApiResponse::success(HealthReport {
        status: "ok",
        running_tasks: running.len(),
        created_tasks: created.len(),
    })))
}
