//! System endpoints: health check.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::health;

/// `GET /health`: dependency health.
///
/// Responds `200 OK` when every dependency is up and
/// `503 Service Unavailable` otherwise, with the report as the body:
///
/// ```json
/// {
///   "healthy": true,
///   "dependencies": [
///     { "name": "database", "status": "up", "latency_ms": 2 },
///     { "name": "cache_queue", "status": "up", "latency_ms": 1 }
///   ]
/// }
/// ```
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = health::check(&state.probes).await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// System routes mounted at the root level.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
