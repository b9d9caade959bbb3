//! Error taxonomy for the HTTP surface.
//!
//! Handlers return [`ApiError`]; the [`IntoResponse`] impl maps each variant
//! to its status code and JSON body. Storage failures are logged with their
//! full context chain but reported to clients as a fixed string.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid device")]
    InvalidDevice,

    #[error("Invalid state")]
    InvalidState,

    /// Malformed or out-of-range request payload.
    #[error("{0}")]
    InvalidRequest(String),

    /// The settings store could not complete a read or write.
    #[error("Database error")]
    Storage(anyhow::Error),

    /// A collaborator service (sensor cloud, camera) failed or timed out.
    #[error("{0}")]
    Upstream(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Storage(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidDevice
            | ApiError::InvalidState
            | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage(err) => {
                error!("database error: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Upstream(msg) => {
                error!("upstream error: {msg}");
                StatusCode::BAD_GATEWAY
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn validation_errors_are_bad_request() {
        assert_eq!(status_of(ApiError::InvalidDevice), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ApiError::InvalidState), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(ApiError::InvalidRequest("startTime is required".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn storage_errors_hide_detail() {
        let err = ApiError::Storage(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.to_string(), "Database error");
        assert_eq!(
            status_of(ApiError::Storage(anyhow::anyhow!("disk on fire"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_errors_are_bad_gateway() {
        assert_eq!(
            status_of(ApiError::Upstream("sensor fetch failed".into())),
            StatusCode::BAD_GATEWAY
        );
    }
}
