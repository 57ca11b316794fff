//! Worker callback endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::services::CallbackError;
use crate::AppState;

/// POST /callbacks/analysis
///
/// Validation failures are 4xx with structured field/message pairs and never
/// reach the job state machine. Late callbacks for finished jobs are dropped
/// inside the router and still answer 200.
pub async fn receive_callback(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match state.callback_router.handle_callback(&body).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(CallbackError::Validation(fields)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "validation failed",
                "fields": fields,
            })),
        )
            .into_response(),
        Err(CallbackError::Internal(e)) => {
            tracing::error!(error = %e, "Callback processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "callback processing failed" })),
            )
                .into_response()
        }
    }
}

/// Build callback routes
pub fn callback_routes() -> Router<AppState> {
    Router::new().route("/callbacks/analysis", post(receive_callback))
}
