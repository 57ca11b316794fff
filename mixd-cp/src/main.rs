//! mixd-cp - DJ application control plane
//!
//! Coordinates the feature-extraction worker and the playback engine:
//! analysis job queue, per-stage callback routing, stem fulfilment, engine
//! session and the colocated worker supervisor.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mixd_common::events::EventBus;

use mixd_cp::config::ControlPlaneConfig;
use mixd_cp::services::{
    engine_channel, CallbackRouter, EngineSession, EngineSessionConfig, QueueEngine,
    QueueEngineConfig, StemCache, StemCacheConfig, StemFulfilment, StemFulfilmentConfig,
    WorkerClient, WorkerClientConfig, WorkerSupervisor, WorkerSupervisorConfig,
};
use mixd_cp::{build_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "mixd-cp", about = "mixd control plane", version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "MIXD_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ControlPlaneConfig::load(cli.config.as_deref())?;

    tracing::info!("Starting mixd-cp (control plane)");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Database: {}", config.database_path.display());
    tracing::info!("Worker: {}", config.worker_server_url);
    tracing::info!("Engine: {}", config.engine_ws_url);

    let db = mixd_cp::db::init_database_pool(&config.database_path).await?;
    tracing::info!("Database connection established");

    let events = EventBus::new(256);
    let cancel = CancellationToken::new();

    // Construction-time dependency graph, no ambient singletons:
    // queue → worker; stems → {cache, queue, engine handle};
    // callback router → {queue, stems, engine handle};
    // engine session → {queue, stems}.
    let worker = Arc::new(WorkerClient::new(WorkerClientConfig {
        base_url: config.worker_server_url.clone(),
        remote: config.worker_server_remote,
        callback_url: config.effective_callback_url(),
        request_timeout: std::time::Duration::from_millis(config.worker_request_timeout_ms),
        upload_timeout: std::time::Duration::from_millis(config.worker_upload_timeout_ms),
    }));

    let queue = Arc::new(QueueEngine::new(
        db.clone(),
        Arc::clone(&worker),
        events.clone(),
        QueueEngineConfig::from(&config),
    ));

    let recovered = queue.recover_interrupted().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Requeued jobs interrupted by the previous run");
    }
    let cleaned =
        mixd_cp::db::jobs::cleanup_older_than(&db, config.job_cleanup_days, mixd_common::time::now())
            .await?;
    if cleaned > 0 {
        tracing::info!(cleaned, "Pruned old job history rows");
    }

    let cache = Arc::new(StemCache::new(StemCacheConfig {
        root: config.stem_cache_dir.clone(),
        max_bytes: config.stem_cache_max_bytes,
    })?);

    let (engine_handle, outbound_rx) = engine_channel(db.clone());

    let stems = Arc::new(StemFulfilment::new(
        db.clone(),
        Arc::clone(&cache),
        Arc::clone(&queue),
        engine_handle.clone(),
        events.clone(),
        StemFulfilmentConfig::from(&config),
    ));

    let callback_router = Arc::new(CallbackRouter::new(
        db.clone(),
        Arc::clone(&queue),
        Arc::clone(&stems),
        engine_handle.clone(),
        events.clone(),
    ));

    let session = Arc::new(EngineSession::new(
        EngineSessionConfig::from(&config),
        db.clone(),
        Arc::clone(&queue),
        Arc::clone(&stems),
        engine_handle,
        outbound_rx,
        events.clone(),
    ));

    let scheduler_task = Arc::clone(&queue).spawn_scheduler(cancel.clone());
    let session_task = Arc::clone(&session).spawn(cancel.clone());

    let supervisor = if config.worker_autostart {
        let supervisor_config = WorkerSupervisorConfig::from_control_plane(&config)
            .expect("validated: autostart requires worker_executable");
        let supervisor = WorkerSupervisor::new(supervisor_config, events.clone());
        if let Err(e) = supervisor.start().await {
            tracing::error!(error = %e, "Worker autostart failed");
        }
        supervisor.spawn_monitor(cancel.clone());
        Some(supervisor)
    } else {
        None
    };

    // Queue events currently feed logging only
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!(event = event.name(), "Event");
        }
    });

    let state = AppState::new(db, callback_router, Arc::clone(&worker), events);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Listening on http://{}", config.bind_addr);
    tracing::info!("Callback endpoint: {}", config.effective_callback_url());

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            shutdown_cancel.cancel();
        })
        .await?;

    cancel.cancel();
    if let Some(supervisor) = supervisor {
        supervisor.stop().await;
    }
    let _ = scheduler_task.await;
    let _ = session_task.await;
    tracing::info!("mixd-cp stopped");

    Ok(())
}
