//! HTTP error responses for the REST routes.
//!
//! The websocket path has its own in-band error events; this type only
//! covers plain request/response handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotConfigured(String),
    #[error("{0}")]
    UpstreamFailed(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
