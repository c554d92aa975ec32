//! Source fetch check, used to verify that a url is reachable and within
//! the input size limit.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use thumbgate_core::GatewayError;
use tracing::debug;

use crate::state::AppState;

/// Body of a test page request
#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub url: String,
}

/// Fetch a source and report its size
///
/// POST /test
pub async fn test_page(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match fetch_length(&state, &headers, &body).await {
        Ok((url, length)) => Json(json!({ "url": url, "length": length })).into_response(),
        Err(err) => state.responses.respond(err, ""),
    }
}

async fn fetch_length(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(String, u64), GatewayError> {
    if !state.config.enable_test_page {
        return Err(GatewayError::FeatureDisabled("test page".to_string()));
    }
    let request: TestRequest = serde_json::from_slice(body)
        .map_err(|e| GatewayError::validation(format!("Invalid test request: {}", e)))?;

    let fetched = state.pipeline.fetch_source(&request.url, headers).await?;
    let mut source = fetched.body;
    // drains the whole body, so it is subject to the input size limit
    let length = tokio::task::spawn_blocking(move || source.len())
        .await
        .map_err(|e| GatewayError::unhandled(format!("Test fetch task failed: {}", e)))??;

    debug!(url = %request.url, length, "Test fetch complete");
    Ok((request.url, length))
}
