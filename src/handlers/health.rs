//! Health and admin metrics endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Public model status (rate limited by IP)
//! - `GET /metrics` - Request and abuse summary (requires scope `*`)

use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::models::{HealthResponse, MetricsResponse};
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK; the model status is in the body.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "ok",
///   "model": "Hcompany/Holo1.5-7B",
///   "load_error": null,
///   "version": "0.1.0"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.backend.status();

    Json(HealthResponse {
        status: status.state,
        model: status.model,
        load_error: status.load_error,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Admin metrics endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "requests_total": 120,
///   "requests_2xx": 110,
///   "requests_4xx": 9,
///   "requests_5xx": 1,
///   "latency_p50_ms": 212.4,
///   "latency_p95_ms": 880.02,
///   "uptime_seconds": 3600,
///   "abuse_stats": {
///     "denied_count": 1,
///     "tracked_entities": 14,
///     "threshold_errors": 5,
///     "window_seconds": 30
///   }
/// }
/// ```
#[instrument(skip(state))]
pub async fn metrics_summary(State(state): State<AppState>) -> Json<MetricsResponse> {
    let summary = state.stats.lock().summary();

    Json(MetricsResponse::new(
        summary,
        state.uptime_seconds(),
        state.gate.abuse().stats(),
    ))
}
