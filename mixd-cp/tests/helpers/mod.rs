//! Shared fixtures for control-plane integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::mpsc;

use mixd_common::events::EventBus;
use mixd_cp::db;
use mixd_cp::models::Track;
use mixd_cp::services::engine_protocol::OutboundMessage;
use mixd_cp::services::{
    engine_channel, CallbackRouter, EngineSession, EngineSessionConfig, QueueEngine,
    QueueEngineConfig, StemCache, StemCacheConfig, StemFulfilment, StemFulfilmentConfig,
    WorkerClient, WorkerClientConfig,
};

/// Deterministic 64-hex content hash from a seed
pub fn content_hash(seed: &str) -> String {
    mixd_common::hash::sha256_hex(seed.as_bytes())
}

/// Create a track row whose file really exists under `dir`
pub async fn insert_track(pool: &SqlitePool, dir: &TempDir, seed: &str) -> Track {
    let hash = content_hash(seed);
    let file_path = dir.path().join(format!("{}.flac", seed));
    std::fs::write(&file_path, b"fLaC\x00fake audio").unwrap();

    let track = Track::new(file_path.to_string_lossy().into_owned(), 1_000, hash);
    db::tracks::insert(pool, &track).await.unwrap();
    track
}

/// Stub extraction worker: acks submissions with the track hash as job id
pub async fn spawn_stub_worker(fail_submit: bool) -> String {
    let submit = move |Json(body): Json<Value>| async move {
        if fail_submit {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "worker overloaded" })),
            )
                .into_response();
        }
        let job_id = body
            .get("track_hash")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Json(json!({ "job_id": job_id })).into_response()
    };

    let app = Router::new()
        .route("/jobs", post(submit))
        .route(
            "/jobs/:id",
            get(|Path(_id): Path<String>| async { Json(json!({ "status": "processing" })) })
                .delete(|Path(_id): Path<String>| async { StatusCode::NO_CONTENT }),
        )
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Stub stem file server; names listed in `failing` answer 404
pub async fn spawn_stub_stem_server(failing: &[&str]) -> String {
    let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
    let handler = move |Path(name): Path<String>| {
        let failing = failing.clone();
        async move {
            if failing.contains(&name) {
                StatusCode::NOT_FOUND.into_response()
            } else {
                (StatusCode::OK, format!("RIFF-pcm-data-{}", name)).into_response()
            }
        }
    };

    let app = Router::new().route("/stems/:name", get(handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Fully wired control plane against an in-memory store and stub worker.
/// The engine session is constructed but not spawned; outbound messages are
/// observed on `outbound`.
pub struct Harness {
    pub db: SqlitePool,
    pub events: EventBus,
    pub worker: Arc<WorkerClient>,
    pub queue: Arc<QueueEngine>,
    pub cache: Arc<StemCache>,
    pub stems: Arc<StemFulfilment>,
    pub router: Arc<CallbackRouter>,
    pub session: Arc<EngineSession>,
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub worker_url: String,
    pub music_dir: TempDir,
    pub cache_dir: TempDir,
}

pub async fn harness() -> Harness {
    let worker_url = spawn_stub_worker(false).await;
    harness_with_worker(&worker_url).await
}

pub async fn harness_with_worker(worker_url: &str) -> Harness {
    let pool = db::init_memory_pool().await.unwrap();
    let events = EventBus::new(64);
    let music_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let worker = Arc::new(WorkerClient::new(WorkerClientConfig {
        base_url: worker_url.to_string(),
        remote: false,
        callback_url: "http://127.0.0.1:5740/callbacks/analysis".to_string(),
        request_timeout: Duration::from_millis(500),
        upload_timeout: Duration::from_secs(5),
    }));

    let queue = Arc::new(QueueEngine::new(
        pool.clone(),
        Arc::clone(&worker),
        events.clone(),
        QueueEngineConfig {
            max_concurrent: 2,
            tick_interval: Duration::from_millis(50),
            grace_period: chrono::Duration::seconds(60),
            processing_timeout: chrono::Duration::minutes(10),
            queued_timeout: chrono::Duration::hours(1),
            retry_base_delay: chrono::Duration::milliseconds(100),
            max_retries: 3,
        },
    ));

    let cache = Arc::new(
        StemCache::new(StemCacheConfig {
            root: cache_dir.path().join("stems"),
            max_bytes: u64::MAX,
        })
        .unwrap(),
    );

    let (engine_handle, outbound) = engine_channel(pool.clone());

    let stems = Arc::new(StemFulfilment::new(
        pool.clone(),
        Arc::clone(&cache),
        Arc::clone(&queue),
        engine_handle.clone(),
        events.clone(),
        StemFulfilmentConfig {
            download_timeout: Duration::from_secs(2),
            converter: "ffmpeg".to_string(),
        },
    ));

    let router = Arc::new(CallbackRouter::new(
        pool.clone(),
        Arc::clone(&queue),
        Arc::clone(&stems),
        engine_handle.clone(),
        events.clone(),
    ));

    // The session task is never spawned in tests; a dummy receiver satisfies
    // the constructor while `outbound` observes the shared channel.
    let (_dummy_handle, dummy_rx) = engine_channel(pool.clone());
    let session = Arc::new(EngineSession::new(
        EngineSessionConfig {
            url: "ws://127.0.0.1:1/engine".to_string(),
            connect_timeout: Duration::from_millis(200),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(100),
        },
        pool.clone(),
        Arc::clone(&queue),
        Arc::clone(&stems),
        engine_handle,
        dummy_rx,
        events.clone(),
    ));

    Harness {
        db: pool,
        events,
        worker,
        queue,
        cache,
        stems,
        router,
        session,
        outbound,
        worker_url: worker_url.to_string(),
        music_dir,
        cache_dir,
    }
}

/// Drain the next outbound engine message, failing after a short wait
pub async fn next_outbound(rx: &mut mpsc::Receiver<OutboundMessage>) -> OutboundMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for outbound engine message")
        .expect("outbound channel closed")
}
