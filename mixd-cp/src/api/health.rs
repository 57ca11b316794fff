//! Health check endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub worker_reachable: bool,
}

/// GET /health
///
/// 503 while the extraction worker is unreachable. Analyses still enqueue,
/// but nothing will be dispatched until the worker comes back.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let worker_reachable = state.worker.health().await;
    let status = if worker_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if worker_reachable { "ok" } else { "degraded" }.to_string(),
            module: "mixd-cp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            worker_reachable,
        }),
    )
        .into_response()
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
