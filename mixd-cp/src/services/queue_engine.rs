//! Analysis queue engine
//!
//! Priority-ordered scheduler with bounded concurrency over the job store.
//! A single scheduling task runs a periodic tick plus wake-on-enqueue; every
//! decision is preceded by a staleness sweep so the rest of the engine only
//! ever sees live jobs. At most one job per content hash is in
//! {queued, processing} at any instant.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mixd_common::{EventBus, MixdEvent};

use crate::db::jobs;
use crate::models::{
    AnalysisJob, AnalysisOptions, DeliveryHook, JobPriority, JobStatus, Track,
};
use crate::services::worker_client::WorkerClient;

#[derive(Debug, Clone)]
pub struct QueueEngineConfig {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    /// Incomplete jobs younger than this are always returned unchanged
    pub grace_period: chrono::Duration,
    pub processing_timeout: chrono::Duration,
    pub queued_timeout: chrono::Duration,
    pub retry_base_delay: chrono::Duration,
    pub max_retries: u32,
}

impl From<&crate::config::ControlPlaneConfig> for QueueEngineConfig {
    fn from(config: &crate::config::ControlPlaneConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_analysis,
            tick_interval: config.tick_interval(),
            grace_period: config.grace_period(),
            processing_timeout: config.processing_timeout(),
            queued_timeout: config.queued_timeout(),
            retry_base_delay: config.retry_base_delay(),
            max_retries: config.analysis_max_retries,
        }
    }
}

/// Result of a bulk re-analysis request
#[derive(Debug, Default, serde::Serialize)]
pub struct BulkSummary {
    pub queued: usize,
    pub failed: usize,
    pub errors: Vec<BulkError>,
}

#[derive(Debug, serde::Serialize)]
pub struct BulkError {
    pub track_id: Uuid,
    pub error: String,
}

/// Counts from one staleness sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processing_failed: usize,
    pub queued_failed: usize,
}

/// The analysis job scheduler
pub struct QueueEngine {
    db: SqlitePool,
    worker: Arc<WorkerClient>,
    events: EventBus,
    config: QueueEngineConfig,
    /// Hashes currently submitted and awaiting completion
    in_flight: Mutex<HashSet<String>>,
    wake_tx: mpsc::Sender<()>,
    wake_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl QueueEngine {
    pub fn new(
        db: SqlitePool,
        worker: Arc<WorkerClient>,
        events: EventBus,
        config: QueueEngineConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(8);
        Self {
            db,
            worker,
            events,
            config,
            in_flight: Mutex::new(HashSet::new()),
            wake_tx,
            wake_rx: std::sync::Mutex::new(Some(wake_rx)),
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Ask the scheduling loop to run a tick soon. Never blocks.
    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Number of jobs currently in flight
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn is_in_flight(&self, hash: &str) -> bool {
        self.in_flight.lock().await.contains(hash)
    }

    /// Request analysis for a track, returning the existing or new job.
    ///
    /// Decision order: sweep stale jobs; return an incomplete job unchanged
    /// when it is younger than the grace period, or whenever `force` is
    /// unset; return a completed job when `force` is unset and no ephemeral
    /// feature (stems) is requested; otherwise create and enqueue.
    pub async fn request_analysis(
        &self,
        track: &Track,
        options: AnalysisOptions,
        priority: JobPriority,
        hook: Option<DeliveryHook>,
        force: bool,
    ) -> Result<AnalysisJob> {
        if options.is_empty() {
            anyhow::bail!("analysis request carries no stages");
        }

        self.sweep_stale().await?;
        // Second precision to match what the store hands back
        let now = mixd_common::time::now_seconds();

        if let Some(existing) = jobs::find_incomplete_by_hash(&self.db, &track.content_hash).await?
        {
            let age = now - existing.created_at;
            if age < self.config.grace_period || !force {
                tracing::debug!(
                    content_hash = %track.content_hash,
                    status = %existing.status,
                    "Returning existing incomplete job"
                );
                return Ok(existing);
            }

            // Forced past the grace period: retire the old job so at most
            // one job per hash stays active.
            tracing::info!(
                content_hash = %track.content_hash,
                "Force re-analysis cancels the running job"
            );
            self.cancel_job(&track.content_hash).await?;
        }

        if !force && !options.has_ephemeral() {
            if let Some(done) = jobs::find_completed_by_hash(&self.db, &track.content_hash).await? {
                tracing::debug!(
                    content_hash = %track.content_hash,
                    "Returning completed job for non-ephemeral request"
                );
                return Ok(done);
            }
        }

        let job = AnalysisJob {
            content_hash: track.content_hash.clone(),
            track_id: track.id,
            source_path: track.file_path.clone(),
            options,
            priority,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries: self.config.max_retries,
            stages_completed: Vec::new(),
            progress: 0,
            hook,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_at: None,
            last_error: None,
        };
        jobs::create(&self.db, &job).await?;

        self.events.emit_lossy(MixdEvent::JobQueued {
            content_hash: job.content_hash.clone(),
            track_id: job.track_id,
            priority: job.priority.as_str().to_string(),
            timestamp: now,
        });
        tracing::info!(
            content_hash = %job.content_hash,
            track_id = %job.track_id,
            priority = %job.priority.as_str(),
            stages = job.options.requested_count(),
            "Analysis job queued"
        );

        self.wake();
        Ok(job)
    }

    /// Re-analyse a set of tracks with `force`, collecting per-id errors
    pub async fn bulk_reanalyze(
        &self,
        track_ids: &[Uuid],
        options: AnalysisOptions,
    ) -> BulkSummary {
        let mut summary = BulkSummary::default();

        for &track_id in track_ids {
            let outcome = async {
                let track = crate::db::tracks::get(&self.db, track_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("track not found"))?;
                self.request_analysis(&track, options, JobPriority::Normal, None, true)
                    .await
            }
            .await;

            match outcome {
                Ok(_) => summary.queued += 1,
                Err(e) => {
                    summary.failed += 1;
                    summary.errors.push(BulkError {
                        track_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            queued = summary.queued,
            failed = summary.failed,
            "Bulk re-analysis enqueued"
        );
        summary
    }

    /// Cancel the active job for a hash. Worker-side cancel is best-effort.
    pub async fn cancel_job(&self, hash: &str) -> Result<bool> {
        if let Err(e) = self.worker.cancel(hash).await {
            tracing::warn!(content_hash = %hash, error = %e, "Worker cancel failed");
        }

        let cancelled = jobs::mark_cancelled(&self.db, hash, mixd_common::time::now()).await?;
        if cancelled {
            self.in_flight.lock().await.remove(hash);
            self.events.emit_lossy(MixdEvent::JobCancelled {
                content_hash: hash.to_string(),
                timestamp: mixd_common::time::now(),
            });
            tracing::info!(content_hash = %hash, "Analysis job cancelled");
            self.wake();
        }
        Ok(cancelled)
    }

    /// Startup recovery: every job left in processing goes back to queued.
    /// The worker may still deliver results for these hashes; the callback
    /// router records them idempotently.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let recovered = jobs::recover_processing(&self.db).await?;
        self.in_flight.lock().await.clear();
        if recovered > 0 {
            tracing::info!(count = recovered, "Recovered interrupted jobs to queued");
        }
        Ok(recovered)
    }

    /// Fail jobs past their processing or queue timeout
    pub async fn sweep_stale(&self) -> Result<SweepReport> {
        let now = mixd_common::time::now();
        let mut report = SweepReport::default();

        let stalled =
            jobs::fail_stale_processing(&self.db, now - self.config.processing_timeout, now)
                .await?;
        for hash in &stalled {
            self.in_flight.lock().await.remove(hash);
            self.events.emit_lossy(MixdEvent::JobFailed {
                content_hash: hash.clone(),
                error: "processing timeout".to_string(),
                timestamp: now,
            });
            tracing::warn!(content_hash = %hash, "Job failed: processing timeout");
        }
        report.processing_failed = stalled.len();

        let expired =
            jobs::fail_stale_queued(&self.db, now - self.config.queued_timeout, now).await?;
        for hash in &expired {
            self.events.emit_lossy(MixdEvent::JobFailed {
                content_hash: hash.clone(),
                error: "queue timeout".to_string(),
                timestamp: now,
            });
            tracing::warn!(content_hash = %hash, "Job failed: queue timeout");
        }
        report.queued_failed = expired.len();

        Ok(report)
    }

    /// The worker (or the local stage computation) finished every requested
    /// stage. Idempotent: a second call finds no incomplete job and no-ops.
    pub async fn handle_job_completion(&self, hash: &str) -> Result<()> {
        let now = mixd_common::time::now();
        if jobs::mark_completed(&self.db, hash, now).await? {
            self.in_flight.lock().await.remove(hash);
            self.events.emit_lossy(MixdEvent::JobCompleted {
                content_hash: hash.to_string(),
                timestamp: now,
            });
            tracing::info!(content_hash = %hash, "Analysis job completed");
            self.wake();
        }
        Ok(())
    }

    /// A submission error or worker-reported failure: schedule a retry with
    /// exponential back-off, or fail permanently once retries are exhausted.
    pub async fn handle_job_failure(&self, hash: &str, error: &str) -> Result<()> {
        self.retry_or_fail(hash, error, self.config.retry_base_delay)
            .await
    }

    /// Stem delivery failed part-way: re-request once, immediately, at high
    /// priority. Repeated failures exhaust the normal retry budget.
    pub async fn handle_stem_failure(&self, hash: &str, error: &str) -> Result<()> {
        jobs::raise_priority(&self.db, hash).await?;
        self.retry_or_fail(hash, error, chrono::Duration::zero())
            .await
    }

    async fn retry_or_fail(
        &self,
        hash: &str,
        error: &str,
        base_delay: chrono::Duration,
    ) -> Result<()> {
        self.in_flight.lock().await.remove(hash);
        let now = mixd_common::time::now();

        match jobs::increment_retry(&self.db, hash, error, base_delay, now).await? {
            Some(job) => {
                let delay_ms = job
                    .retry_at
                    .map(|at| (at - now).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                self.events.emit_lossy(MixdEvent::JobRetried {
                    content_hash: hash.to_string(),
                    retry_count: job.retry_count,
                    delay_ms,
                    timestamp: now,
                });
                tracing::warn!(
                    content_hash = %hash,
                    retry_count = job.retry_count,
                    delay_ms,
                    error,
                    "Analysis job scheduled for retry"
                );
                self.wake();
            }
            None => {
                // Either retries are exhausted (increment_retry marked the
                // job failed) or no incomplete job matches the hash.
                self.events.emit_lossy(MixdEvent::JobFailed {
                    content_hash: hash.to_string(),
                    error: error.to_string(),
                    timestamp: now,
                });
                tracing::error!(content_hash = %hash, error, "Analysis job failed permanently");
            }
        }
        Ok(())
    }

    /// One scheduling pass: sweep, then fill free slots in priority order
    pub async fn tick(&self) -> Result<()> {
        if let Err(e) = self.sweep_stale().await {
            tracing::error!(error = %e, "Staleness sweep failed");
        }

        let capacity = {
            let in_flight = self.in_flight.lock().await;
            self.config.max_concurrent.saturating_sub(in_flight.len())
        };
        if capacity == 0 {
            return Ok(());
        }

        let now = mixd_common::time::now();
        let candidates = jobs::find_queued(&self.db, (capacity * 2) as i64, now).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        if !self.worker.health().await {
            tracing::debug!("Extraction worker unavailable, skipping tick");
            return Ok(());
        }

        let mut dispatched = 0;
        for job in candidates {
            if dispatched >= capacity {
                break;
            }
            if self.dispatch(&job, now).await? {
                dispatched += 1;
            }
        }
        Ok(())
    }

    /// Submit one queued job. Returns false when the slot was not used.
    async fn dispatch(&self, job: &AnalysisJob, now: DateTime<Utc>) -> Result<bool> {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(job.content_hash.clone()) {
                return Ok(false);
            }
        }

        if !jobs::mark_processing(&self.db, &job.content_hash, now).await? {
            // Raced with a cancel or sweep between SELECT and UPDATE
            self.in_flight.lock().await.remove(&job.content_hash);
            return Ok(false);
        }

        self.events.emit_lossy(MixdEvent::JobProcessing {
            content_hash: job.content_hash.clone(),
            timestamp: now,
        });
        tracing::info!(
            content_hash = %job.content_hash,
            priority = %job.priority.as_str(),
            "Dispatching job to extraction worker"
        );

        if let Err(e) = self.worker.submit(job).await {
            tracing::warn!(
                content_hash = %job.content_hash,
                error = %e,
                "Worker submission failed"
            );
            self.handle_job_failure(&job.content_hash, &e.to_string())
                .await?;
        }
        Ok(true)
    }

    /// Run the scheduling loop until cancelled
    pub fn spawn_scheduler(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = self;
        let mut wake_rx = engine
            .wake_rx
            .lock()
            .expect("wake receiver lock")
            .take()
            .expect("scheduler started twice");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    woken = wake_rx.recv() => {
                        if woken.is_none() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("Queue scheduler stopping");
                        break;
                    }
                }

                if let Err(e) = engine.tick().await {
                    tracing::error!(error = %e, "Queue tick failed");
                }
            }
        })
    }
}
