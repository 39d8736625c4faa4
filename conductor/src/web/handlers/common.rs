// Common types and utilities for API handlers

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::Json,
};
use chrono::Utc;
use serde::Serialize;

use crate::errors::{domain_error, error_code, ErrorKind};

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            code: None,
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(code: &str, message: String) -> Self {
        Self {
            success: false,
            data: None,
            code: Some(code.to_string()),
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub fn status_for(err: &anyhow::Error) -> StatusCode {
    match domain_error(err).map(|e| e.kind()) {
        Some(ErrorKind::Validation) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::Authorization) => StatusCode::UNAUTHORIZED,
        Some(ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::Conflict) | Some(ErrorKind::ConcernBlocked) => StatusCode::CONFLICT,
        Some(ErrorKind::Execution) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::Liveness) => StatusCode::SERVICE_UNAVAILABLE,
        Some(ErrorKind::Internal) | None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a service error onto the JSON error envelope
pub fn error_response(err: anyhow::Error) -> (StatusCode, Json<ApiResponse<()>>) {
    (
        status_for(&err),
        Json(ApiResponse::error(error_code(&err), format!("{:#}", err))),
    )
}

/// Bearer token presented by a job
pub struct JobToken(pub String);

impl<S: Send + Sync> FromRequestParts<S> for JobToken {
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "));

        match token {
            Some(token) if !token.is_empty() => Ok(JobToken(token.to_string())),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error("AUTH_ERROR", "missing bearer token".to_string())),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConductorError;
    use rstest::rstest;

    #[rstest]
    #[case(ConductorError::ObjectNotFound { object: "host h1".into() }, StatusCode::NOT_FOUND)]
    #[case(ConductorError::Plugin { reason: "no".into() }, StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(ConductorError::TaskBlocked { object: "c1".into(), reason: "locked".into() }, StatusCode::CONFLICT)]
    #[case(ConductorError::Authorization { user: "job #1".into(), action: "plugin".into() }, StatusCode::UNAUTHORIZED)]
    #[case(ConductorError::ConfigKey { key: "a".into(), reason: "unknown".into() }, StatusCode::BAD_REQUEST)]
    fn test_status_mapping(#[case] err: ConductorError, #[case] expected: StatusCode) {
        assert_eq!(status_for(&err.into()), expected);
    }

    #[test]
    fn test_untyped_errors_are_internal() {
        let err = anyhow::anyhow!("disk full");
        let (status, Json(body)) = error_response(err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.code.as_deref(), Some("INTERNAL_ERROR"));
        assert!(!body.success);
    }
}
