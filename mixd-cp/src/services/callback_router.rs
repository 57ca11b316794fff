//! Callback router
//!
//! Receives per-stage results from the extraction worker, validates them,
//! fans out to the track and waveform stores and fires delivery hooks.
//! Idempotency per (job, stage): a stage already recorded on a *completed*
//! job is ignored; on a still-incomplete job it is reprocessed, which keeps
//! at-least-once delivery to the engine without double-persisting; feature
//! upserts are stable under replay.

use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;

use mixd_common::{EventBus, MixdEvent};

use crate::db::{jobs, tracks, waveforms};
use crate::models::callback::{
    BasicFeaturesData, CallbackEnvelope, CallbackStage, CharacteristicsData, FieldError, StemsData,
};
use crate::models::{AnalysisJob, AnalysisStage, HookKind};
use crate::services::engine_session::EngineHandle;
use crate::services::queue_engine::QueueEngine;
use crate::services::stem_fulfilment::StemFulfilment;

/// Version stamped onto tracks when a characteristics stage lands
pub const ANALYSIS_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum CallbackError {
    /// Malformed callback; surfaced as 4xx at the HTTP boundary and never
    /// reaches the job state machine.
    #[error("callback validation failed")]
    Validation(Vec<FieldError>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CallbackError {
    pub fn fields(&self) -> Option<&[FieldError]> {
        match self {
            CallbackError::Validation(fields) => Some(fields),
            CallbackError::Internal(_) => None,
        }
    }
}

/// Routes worker callbacks into stores, queue engine and engine session
pub struct CallbackRouter {
    db: SqlitePool,
    queue: Arc<QueueEngine>,
    stems: Arc<StemFulfilment>,
    engine: EngineHandle,
    events: EventBus,
}

impl CallbackRouter {
    pub fn new(
        db: SqlitePool,
        queue: Arc<QueueEngine>,
        stems: Arc<StemFulfilment>,
        engine: EngineHandle,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            queue,
            stems,
            engine,
            events,
        }
    }

    /// Handle one callback body. Ok(()) covers dropped late callbacks too;
    /// only validation and store failures surface as errors.
    pub async fn handle_callback(&self, body: &serde_json::Value) -> Result<(), CallbackError> {
        let envelope = CallbackEnvelope::from_value(body).map_err(CallbackError::Validation)?;

        tracing::debug!(
            job_id = %envelope.job_id,
            stage = envelope.stage.as_str(),
            "Worker callback received"
        );

        match envelope.stage {
            CallbackStage::JobCompleted => {
                self.queue
                    .handle_job_completion(&envelope.job_id)
                    .await
                    .map_err(CallbackError::Internal)?;
                Ok(())
            }
            CallbackStage::JobFailed | CallbackStage::Error => {
                self.queue
                    .handle_job_failure(&envelope.job_id, &envelope.error_message())
                    .await
                    .map_err(CallbackError::Internal)?;
                Ok(())
            }
            CallbackStage::Analysis(stage) => self.handle_stage(&envelope, stage).await,
        }
    }

    async fn handle_stage(
        &self,
        envelope: &CallbackEnvelope,
        stage: AnalysisStage,
    ) -> Result<(), CallbackError> {
        // A stage callback flagged failed by the worker goes straight into
        // the retry machinery.
        if matches!(envelope.status.as_deref(), Some("error") | Some("failed")) {
            self.queue
                .handle_job_failure(&envelope.job_id, &envelope.error_message())
                .await
                .map_err(CallbackError::Internal)?;
            return Ok(());
        }

        let job = match jobs::find_incomplete_by_hash(&self.db, &envelope.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Completed job already carrying this stage, or a cancelled
                // or unknown job: logged and dropped.
                tracing::info!(
                    job_id = %envelope.job_id,
                    stage = %stage,
                    "Dropping callback with no incomplete job"
                );
                return Ok(());
            }
            Err(e) => return Err(CallbackError::Internal(e)),
        };

        if job.has_stage(stage) {
            // Prior attempt aborted mid-delivery; reprocess so the engine
            // still gets its push.
            tracing::info!(
                job_id = %job.content_hash,
                stage = %stage,
                "Reprocessing already-recorded stage on incomplete job"
            );
        }

        match stage {
            AnalysisStage::BasicFeatures => self.handle_basic_features(&job, envelope).await,
            AnalysisStage::Characteristics => self.handle_characteristics(&job, envelope).await,
            AnalysisStage::Stems => self.handle_stems(&job, envelope).await,
            AnalysisStage::Genre | AnalysisStage::Segments | AnalysisStage::Transitions => {
                // Reserved stages: the worker does not ship payloads for
                // these yet; completion is still tracked.
                self.record_stage(&job, stage).await
            }
        }
    }

    async fn handle_basic_features(
        &self,
        job: &AnalysisJob,
        envelope: &CallbackEnvelope,
    ) -> Result<(), CallbackError> {
        let data =
            BasicFeaturesData::from_value(&envelope.data).map_err(CallbackError::Validation)?;

        tracks::update_basic_features(&self.db, job.track_id, &data)
            .await
            .map_err(CallbackError::Internal)?;

        for block in data.waveforms {
            let waveform = block
                .into_waveform(&job.content_hash)
                .map_err(|e| CallbackError::Validation(vec![e]))?;
            waveforms::upsert(&self.db, &waveform)
                .await
                .map_err(CallbackError::Internal)?;
        }

        self.record_stage(job, AnalysisStage::BasicFeatures).await?;

        if let Some(hook) = &job.hook {
            if hook.kind == HookKind::TrackInfo {
                self.engine
                    .send_track_info(hook.engine_track_id, hook.correlation_id.clone())
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_characteristics(
        &self,
        job: &AnalysisJob,
        envelope: &CallbackEnvelope,
    ) -> Result<(), CallbackError> {
        let data =
            CharacteristicsData::from_value(&envelope.data).map_err(CallbackError::Validation)?;

        tracks::update_characteristics(
            &self.db,
            job.track_id,
            &data,
            mixd_common::time::now(),
            ANALYSIS_VERSION,
        )
        .await
        .map_err(CallbackError::Internal)?;

        self.record_stage(job, AnalysisStage::Characteristics).await
    }

    async fn handle_stems(
        &self,
        job: &AnalysisJob,
        envelope: &CallbackEnvelope,
    ) -> Result<(), CallbackError> {
        let data = StemsData::from_value(&envelope.data).map_err(CallbackError::Validation)?;

        // Stem waveforms ride along on the callback and persist regardless
        // of how the file handover goes.
        for block in data.waveforms.clone() {
            let waveform = block
                .into_waveform(&job.content_hash)
                .map_err(|e| CallbackError::Validation(vec![e]))?;
            waveforms::upsert(&self.db, &waveform)
                .await
                .map_err(CallbackError::Internal)?;
        }

        match self.stems.fulfil(job, &data).await {
            Ok(cached) => {
                // Cache insertion succeeded: push first, then record the
                // stage. A job without a hook still populated the cache.
                if let Some(hook) = &job.hook {
                    if hook.kind == HookKind::Stems {
                        self.engine.send_stems_ready(
                            hook.engine_track_id,
                            hook.correlation_id.clone(),
                            cached,
                        );
                    }
                }
                self.record_stage(job, AnalysisStage::Stems).await
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %job.content_hash,
                    error = %e,
                    "Stem fulfilment failed, re-requesting at high priority"
                );
                self.queue
                    .handle_stem_failure(&job.content_hash, &e.to_string())
                    .await
                    .map_err(CallbackError::Internal)?;
                Ok(())
            }
        }
    }

    /// Record a stage on the job; when that completes every requested stage
    /// the queue engine's completion handler runs. Redundant with the
    /// worker's own `job_completed`: whichever lands first wins and the
    /// other no-ops.
    async fn record_stage(
        &self,
        job: &AnalysisJob,
        stage: AnalysisStage,
    ) -> Result<(), CallbackError> {
        let updated = jobs::record_stage(&self.db, &job.content_hash, stage)
            .await
            .map_err(CallbackError::Internal)?;

        if let Some(updated) = updated {
            self.events.emit_lossy(MixdEvent::JobStageCompleted {
                content_hash: updated.content_hash.clone(),
                stage: stage.as_str().to_string(),
                progress: updated.progress,
                timestamp: mixd_common::time::now(),
            });
            tracing::info!(
                job_id = %updated.content_hash,
                stage = %stage,
                progress = updated.progress,
                "Analysis stage recorded"
            );

            if updated.all_stages_done() {
                self.queue
                    .handle_job_completion(&updated.content_hash)
                    .await
                    .map_err(CallbackError::Internal)?;
            }
        }
        Ok(())
    }
}
