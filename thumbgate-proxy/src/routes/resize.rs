//! The resize endpoint.

use std::sync::Arc;

use axum::{
    extract::{RawQuery, State},
    http::HeaderMap,
    response::Response,
};
use thumbgate_core::ResizeRequest;

use crate::coordinator::Outcome;
use crate::metrics::RequestTimer;
use crate::state::AppState;

/// Resize an upstream image
///
/// GET /?url=...&width=...&height=...
pub async fn resize(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let query = query.unwrap_or_default();
    let timer = RequestTimer::new();
    state.stats.lock().await.requests_total += 1;

    match serve(&state, &query, &headers).await {
        Ok(cached) => {
            state.stats.lock().await.requests_success += 1;
            timer.record_success();
            cached.to_response()
        }
        Err(err) => {
            state.stats.lock().await.requests_failed += 1;
            timer.record_failure();
            state.responses.respond(err, &query)
        }
    }
}

async fn serve(state: &AppState, query: &str, headers: &HeaderMap) -> Outcome {
    let request = ResizeRequest::parse(query)?;
    let fingerprint = request.fingerprint();
    state
        .coordinator
        .execute(&fingerprint, || state.pipeline.run(&request, headers))
        .await
}
