// File: runner/src/handlers.rs
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
};
use std::sync::Arc;
use tracing::{error, info};

use crate::middleware::ApiKeyAuth;
use crate::types::{
    ApiResponse, CleanupRequest, CleanupResult, HealthInfo, JobInfo, JobLogs, RunJobRequest,
};
use crate::AppState;

type HandlerResult<T> = Result<ResponseJson<ApiResponse<T>>, (StatusCode, ResponseJson<ApiResponse<()>>)>;

const DEFAULT_CLEANUP_HOURS: i64 = 24;

fn not_found(job_id: i64) -> (StatusCode, ResponseJson<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        ResponseJson(ApiResponse::error(format!("job {} is unknown", job_id))),
    )
}

pub async fn health(State(state): State<Arc<AppState>>) -> ResponseJson<ApiResponse<HealthInfo>> {
    ResponseJson(ApiResponse::success(HealthInfo {
        status: "ok".to_string(),
        running_jobs: state.jobs.get_running_jobs().await.len(),
    }))
}

pub async fn submit_job(
    _auth: ApiKeyAuth,
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunJobRequest>,
) -> HandlerResult<JobInfo> {
    let job_id = request.job_id;
    info!("Received job {} in {}", job_id, request.work_dir);
    match state.jobs.start_job(request).await {
        Ok(info) => Ok(ResponseJson(ApiResponse::success(info))),
        Err(e) => {
            error!("Failed to start job {}: {}", job_id, e);
            Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                ResponseJson(ApiResponse::error(format!("Failed to start job: {}", e))),
            ))
        }
    }
}

pub async fn get_job(
    _auth: ApiKeyAuth,
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> HandlerResult<JobInfo> {
    state
        .jobs
        .get_job(job_id)
        .await
        .map(|info| ResponseJson(ApiResponse::success(info)))
        .ok_or_else(|| not_found(job_id))
}

pub async fn terminate_job(
    _auth: ApiKeyAuth,
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> HandlerResult<JobInfo> {
    if !state.jobs.terminate(job_id).await {
        return Err(not_found(job_id));
    }
    get_job(ApiKeyAuth, State(state), Path(job_id)).await
}

pub async fn get_logs(
    _auth: ApiKeyAuth,
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<i64>,
) -> HandlerResult<JobLogs> {
    state
        .jobs
        .read_logs(job_id)
        .await
        .map(|logs| ResponseJson(ApiResponse::success(logs)))
        .ok_or_else(|| not_found(job_id))
}

pub async fn cleanup_jobs(
    _auth: ApiKeyAuth,
    State(state): State<Arc<AppState>>,
    Json(request): Json<CleanupRequest>,
) -> HandlerResult<CleanupResult> {
    let removed = state
        .jobs
        .cleanup_old_jobs(request.max_hours.unwrap_or(DEFAULT_CLEANUP_HOURS))
        .await;
    Ok(ResponseJson(ApiResponse::success(CleanupResult { removed })))
}
