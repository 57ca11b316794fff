//! Stem fulfilment pipeline
//!
//! On-demand stems for the playback engine: probe the cache, otherwise queue
//! a high-priority stems-only job; when the worker's callback lands, obtain
//! the four files (shared-fs path, parallel download, or base64 decode),
//! normalise them to PCM with an external converter when needed, and insert
//! the set into the cache atomically. Delivery is all-or-nothing: any
//! missing stem throws the whole attempt away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use uuid::Uuid;

use mixd_common::{EventBus, MixdEvent};

use crate::models::callback::{StemDelivery, StemsData, STEM_NAMES};
use crate::models::{AnalysisJob, AnalysisOptions, DeliveryHook, HookKind, JobPriority, Track};
use crate::services::engine_session::EngineHandle;
use crate::services::queue_engine::QueueEngine;
use crate::services::stem_cache::StemCache;

#[derive(Debug, Clone)]
pub struct StemFulfilmentConfig {
    /// Per-stem download timeout
    pub download_timeout: Duration,
    /// External converter executable (ffmpeg-compatible CLI)
    pub converter: String,
}

impl From<&crate::config::ControlPlaneConfig> for StemFulfilmentConfig {
    fn from(config: &crate::config::ControlPlaneConfig) -> Self {
        Self {
            download_timeout: Duration::from_millis(config.stem_download_timeout_ms),
            converter: config.converter_executable.clone(),
        }
    }
}

/// The stem fulfilment service
pub struct StemFulfilment {
    db: SqlitePool,
    cache: Arc<StemCache>,
    queue: Arc<QueueEngine>,
    engine: EngineHandle,
    events: EventBus,
    http: reqwest::Client,
    config: StemFulfilmentConfig,
}

impl StemFulfilment {
    pub fn new(
        db: SqlitePool,
        cache: Arc<StemCache>,
        queue: Arc<QueueEngine>,
        engine: EngineHandle,
        events: EventBus,
        config: StemFulfilmentConfig,
    ) -> Self {
        Self {
            db,
            cache,
            queue,
            engine,
            events,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Engine request path: cache hit pushes immediately, miss queues a
    /// stems-only job carrying the stems delivery hook.
    pub async fn request_for_engine(
        &self,
        track: &Track,
        request_id: Option<String>,
    ) -> Result<()> {
        if let Some(cached) = self.cache.get(&track.content_hash).await {
            tracing::debug!(
                track_id = %track.id,
                content_hash = %track.content_hash,
                "Stem cache hit, pushing to engine"
            );
            self.engine.send_stems_ready(track.id, request_id, cached);
            return Ok(());
        }

        let hook = DeliveryHook {
            kind: HookKind::Stems,
            engine_track_id: track.id,
            correlation_id: request_id,
        };
        self.queue
            .request_analysis(
                track,
                AnalysisOptions::stems_only(),
                JobPriority::High,
                Some(hook),
                false,
            )
            .await?;
        Ok(())
    }

    /// Callback path: obtain, normalise and cache the four stems. Returns
    /// the cached paths; the caller pushes to the engine and records the
    /// stage only after this succeeds. Every temp file is gone by return.
    pub async fn fulfil(
        &self,
        job: &AnalysisJob,
        data: &StemsData,
    ) -> Result<HashMap<String, PathBuf>> {
        let temp_dir = std::env::temp_dir().join(format!("mixd-stems-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&temp_dir).await?;

        let outcome = self.fulfil_inner(job, data, &temp_dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
            tracing::warn!(dir = %temp_dir.display(), error = %e, "Failed to remove temp dir");
        }
        outcome
    }

    async fn fulfil_inner(
        &self,
        job: &AnalysisJob,
        data: &StemsData,
        temp_dir: &Path,
    ) -> Result<HashMap<String, PathBuf>> {
        let extension = data.format.as_deref().unwrap_or("wav");

        let files = match data.delivery {
            StemDelivery::Paths => {
                let mut files = HashMap::new();
                for name in STEM_NAMES {
                    let path = PathBuf::from(&data.stems[name]);
                    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                        bail!("stem {:?} missing at {}", name, path.display());
                    }
                    files.insert(name.to_string(), path);
                }
                files
            }
            StemDelivery::Urls => self.download_all(&data.stems, temp_dir, extension).await?,
            StemDelivery::Base64 => Self::decode_all(&data.stems, temp_dir, extension).await?,
        };

        let files = if data.is_normalized() {
            files
        } else {
            self.convert_all(&files, temp_dir).await?
        };

        let cached = self
            .cache
            .set(&job.content_hash, &files)
            .await
            .context("stem cache insert")?;

        let total_bytes = cached
            .values()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        self.events.emit_lossy(MixdEvent::StemsCached {
            content_hash: job.content_hash.clone(),
            total_bytes,
            timestamp: mixd_common::time::now(),
        });
        tracing::info!(
            content_hash = %job.content_hash,
            total_bytes,
            "Stem set cached"
        );

        Ok(cached)
    }

    /// Download all four stems in parallel with a per-stem timeout.
    /// All-or-nothing: the first failure fails the attempt.
    async fn download_all(
        &self,
        stems: &HashMap<String, String>,
        temp_dir: &Path,
        extension: &str,
    ) -> Result<HashMap<String, PathBuf>> {
        let downloads = STEM_NAMES.map(|name| {
            let url = stems[name].clone();
            let target = temp_dir.join(format!("{}.{}", name, extension));
            async move {
                let response = self
                    .http
                    .get(&url)
                    .timeout(self.config.download_timeout)
                    .send()
                    .await
                    .with_context(|| format!("downloading stem {:?}", name))?;
                if !response.status().is_success() {
                    bail!("stem {:?} download returned {}", name, response.status());
                }
                let bytes = response
                    .bytes()
                    .await
                    .with_context(|| format!("reading stem {:?} body", name))?;
                tokio::fs::write(&target, &bytes).await?;
                Ok::<_, anyhow::Error>((name.to_string(), target))
            }
        });

        let mut files = HashMap::new();
        for result in join_all(downloads).await {
            let (name, path) = result?;
            files.insert(name, path);
        }
        Ok(files)
    }

    /// Decode base64 payloads to temp files (legacy remote delivery)
    async fn decode_all(
        stems: &HashMap<String, String>,
        temp_dir: &Path,
        extension: &str,
    ) -> Result<HashMap<String, PathBuf>> {
        let mut files = HashMap::new();
        for name in STEM_NAMES {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(stems[name].as_bytes())
                .with_context(|| format!("decoding stem {:?}", name))?;
            let target = temp_dir.join(format!("{}.{}", name, extension));
            tokio::fs::write(&target, &bytes).await?;
            files.insert(name.to_string(), target);
        }
        Ok(files)
    }

    /// Transcode all four stems to PCM WAV in parallel with the external
    /// converter tool.
    async fn convert_all(
        &self,
        files: &HashMap<String, PathBuf>,
        temp_dir: &Path,
    ) -> Result<HashMap<String, PathBuf>> {
        let conversions = STEM_NAMES.map(|name| {
            let source = files[name].clone();
            let target = temp_dir.join(format!("{}.wav", name));
            let converter = self.config.converter.clone();
            async move {
                let output = tokio::process::Command::new(&converter)
                    .arg("-y")
                    .arg("-nostdin")
                    .arg("-loglevel")
                    .arg("error")
                    .arg("-i")
                    .arg(&source)
                    .arg(&target)
                    .output()
                    .await
                    .with_context(|| format!("running {} for stem {:?}", converter, name))?;
                if !output.status.success() {
                    bail!(
                        "converting stem {:?} failed: {}",
                        name,
                        String::from_utf8_lossy(&output.stderr)
                    );
                }
                Ok::<_, anyhow::Error>((name.to_string(), target))
            }
        });

        let mut converted = HashMap::new();
        for result in join_all(conversions).await {
            let (name, path) = result?;
            converted.insert(name, path);
        }
        Ok(converted)
    }
}
