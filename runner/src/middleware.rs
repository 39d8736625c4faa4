//! Bearer API key check shared by every job route.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::Json,
};
use std::sync::Arc;

use crate::types::ApiResponse;
use crate::AppState;

/// Extractor that rejects requests without the runner's API key.
///
/// ```ignore
/// async fn handler(_auth: ApiKeyAuth, State(state): State<Arc<AppState>>) { ... }
/// ```
pub struct ApiKeyAuth;

impl FromRequestParts<Arc<AppState>> for ApiKeyAuth {
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));

        match token {
            Some(token) if token == state.api_key => Ok(ApiKeyAuth),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error("invalid or missing API key".to_string())),
            )),
        }
    }
}
