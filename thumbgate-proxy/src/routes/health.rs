//! Health check, configuration and metrics endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::metrics::encode_metrics;
use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Effective configuration
///
/// GET /config
pub async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match serde_json::to_string_pretty(&state.config) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            e.to_string(),
        ),
    }
}

/// Metrics endpoint with request, admission and coordination statistics
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = *state.stats.lock().await;
    let coordinator = &state.coordinator;

    Json(json!({
        "requests": {
            "total": stats.requests_total,
            "success": stats.requests_success,
            "failed": stats.requests_failed,
            "rejected": stats.requests_rejected,
            "success_rate": stats.success_rate()
        },
        "admission": {
            "max_clients": state.admission.max_clients(),
            "available": state.admission.available()
        },
        "coordinator": {
            "sharing": coordinator.is_sharing(),
            "max_concurrency": coordinator.max_concurrency(),
            "available_permits": coordinator.available_permits(),
            "in_flight": coordinator.in_flight_count(),
            "coalesced": coordinator.coalesced_count()
        }
    }))
}

/// Prometheus text exposition
///
/// GET /metrics/prometheus
pub async fn metrics_prometheus() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
