// Plugin callbacks from running jobs

use axum::extract::{Path, State};
use axum::response::Json;

use super::common::{error_response, ApiResponse, ApiResult, JobToken};
use crate::plugin::{PluginCall, PluginResult};
use crate::web::AppState;

pub async fn plugin_call(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
    JobToken(token): JobToken,
    Json(call): Json<PluginCall>,
) -> ApiResult<PluginResult> {
    state
        .plugin
        .handle(job_id, &token, call)
        .await
        .map(|result| Json(ApiResponse::success(result)))
        .map_err(error_response)
}
