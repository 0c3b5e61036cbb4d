//! Short-lived browser credentials for client-side transcription.
//!
//! The frontend talks to the speech-to-text websocket directly; this
//! route mints a single-use token so the long-lived API key never
//! reaches the browser.

use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::error;

use crate::error::ApiError;
use crate::state::AppState;

const TOKEN_ENDPOINT: &str = "https://api.elevenlabs.io/v1/single-use-token/realtime_scribe";
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router() -> Router<AppState> {
    Router::new().route("/elevenlabs-token", get(issue_token))
}

async fn issue_token(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let api_key = state
        .synthesis
        .api_key
        .clone()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::NotConfigured("ELEVENLABS_API_KEY is not set".to_string()))?;

    let response = state
        .http
        .post(TOKEN_ENDPOINT)
        .header("xi-api-key", api_key)
        .timeout(TOKEN_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|err| {
            error!(error = %err, "single-use token request failed to send");
            ApiError::UpstreamFailed("token request failed".to_string())
        })?;

    let status = response.status();
    if !status.is_success() {
        error!(status = %status, "single-use token request rejected");
        return Err(ApiError::UpstreamFailed(format!("upstream status {status}")));
    }

    let body: Value = response.json().await.map_err(|err| {
        error!(error = %err, "failed to parse single-use token response");
        ApiError::UpstreamFailed("unparseable token response".to_string())
    })?;

    let token = body
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::UpstreamFailed("token missing from response".to_string()))?;

    Ok(Json(json!({ "token": token })))
}
