//! mixd-cp library interface
//!
//! Exposes the control-plane internals for integration testing. The binary
//! in `main.rs` wires the same pieces together.

pub mod api;
pub mod config;
pub mod db;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::Router;
use sqlx::SqlitePool;

use mixd_common::events::EventBus;

use crate::services::{CallbackRouter, WorkerClient};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Routes worker callbacks into stores and delivery hooks
    pub callback_router: Arc<CallbackRouter>,
    /// Worker client, used by the health endpoint's liveness probe
    pub worker: Arc<WorkerClient>,
    /// Event bus for queue and session lifecycle events
    pub events: EventBus,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        callback_router: Arc<CallbackRouter>,
        worker: Arc<WorkerClient>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            callback_router,
            worker,
            events,
        }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::callback_routes())
        .merge(api::waveform_routes())
        .merge(api::health_routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
