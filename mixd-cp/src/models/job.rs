//! Analysis job model
//!
//! A job identifies a unit of computation on audio, not on a file: its id is
//! the content hash, so duplicate files share work and historical rows per
//! hash differ only by created_at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an analysis job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether `self → to` is a legal transition
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Queued, Completed)
                | (Processing, Queued)
        )
        // Queued → Failed covers the queue-timeout sweep; Processing → Queued
        // covers retry scheduling and crash recovery; Queued → Completed
        // covers a recovered job finished by late pre-restart callbacks.
        // Failed → Queued happens only via a new enqueue (new row), never by
        // mutating a failed row.
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority; higher dequeues first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }

    /// Numeric rank used for ORDER BY (high > normal > low)
    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            _ => None,
        }
    }
}

/// One atomic unit of analysis output from the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    BasicFeatures,
    Characteristics,
    Genre,
    Stems,
    Segments,
    Transitions,
}

impl AnalysisStage {
    pub const ALL: [AnalysisStage; 6] = [
        AnalysisStage::BasicFeatures,
        AnalysisStage::Characteristics,
        AnalysisStage::Genre,
        AnalysisStage::Stems,
        AnalysisStage::Segments,
        AnalysisStage::Transitions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStage::BasicFeatures => "basic_features",
            AnalysisStage::Characteristics => "characteristics",
            AnalysisStage::Genre => "genre",
            AnalysisStage::Stems => "stems",
            AnalysisStage::Segments => "segments",
            AnalysisStage::Transitions => "transitions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic_features" => Some(AnalysisStage::BasicFeatures),
            "characteristics" => Some(AnalysisStage::Characteristics),
            "genre" => Some(AnalysisStage::Genre),
            "stems" => Some(AnalysisStage::Stems),
            "segments" => Some(AnalysisStage::Segments),
            "transitions" => Some(AnalysisStage::Transitions),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages a job requests from the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    #[serde(default)]
    pub basic_features: bool,
    #[serde(default)]
    pub characteristics: bool,
    #[serde(default)]
    pub genre: bool,
    #[serde(default)]
    pub stems: bool,
    #[serde(default)]
    pub segments: bool,
    #[serde(default)]
    pub transitions: bool,
}

impl AnalysisOptions {
    /// The default full-analysis request: persistent features only
    pub fn standard() -> Self {
        Self {
            basic_features: true,
            characteristics: true,
            ..Default::default()
        }
    }

    /// Stems on demand, nothing else
    pub fn stems_only() -> Self {
        Self {
            stems: true,
            ..Default::default()
        }
    }

    /// Basic features only (engine needs tempo/beats before anything else)
    pub fn basic_only() -> Self {
        Self {
            basic_features: true,
            ..Default::default()
        }
    }

    pub fn contains(&self, stage: AnalysisStage) -> bool {
        match stage {
            AnalysisStage::BasicFeatures => self.basic_features,
            AnalysisStage::Characteristics => self.characteristics,
            AnalysisStage::Genre => self.genre,
            AnalysisStage::Stems => self.stems,
            AnalysisStage::Segments => self.segments,
            AnalysisStage::Transitions => self.transitions,
        }
    }

    pub fn requested_stages(&self) -> Vec<AnalysisStage> {
        AnalysisStage::ALL
            .into_iter()
            .filter(|s| self.contains(*s))
            .collect()
    }

    pub fn requested_count(&self) -> usize {
        self.requested_stages().len()
    }

    /// Stems are ephemeral (cache-only); a request carrying them never
    /// short-circuits on a previously completed job.
    pub fn has_ephemeral(&self) -> bool {
        self.stems
    }

    pub fn is_empty(&self) -> bool {
        self.requested_count() == 0
    }
}

/// Downstream action to take when a specific stage completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookKind {
    #[serde(rename = "audio_server_track_info")]
    TrackInfo,
    #[serde(rename = "audio_server_stems")]
    Stems,
}

/// Delivery hook attached to a job: push results to the playback engine for
/// a specific request once the relevant stage lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryHook {
    pub kind: HookKind,
    pub engine_track_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A queued/running/finished unit of analysis work, keyed by content hash
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub content_hash: String,
    pub track_id: Uuid,
    pub source_path: String,
    pub options: AnalysisOptions,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub stages_completed: Vec<AnalysisStage>,
    pub progress: u8,
    pub hook: Option<DeliveryHook>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AnalysisJob {
    /// Progress percent for a set of recorded stages against requested options
    pub fn progress_percent(options: &AnalysisOptions, completed: &[AnalysisStage]) -> u8 {
        let requested = options.requested_count();
        if requested == 0 {
            return 0;
        }
        let done = completed.iter().filter(|s| options.contains(**s)).count();
        ((done as f64 / requested as f64) * 100.0).round() as u8
    }

    /// Whether every requested stage has been recorded
    pub fn all_stages_done(&self) -> bool {
        self.options
            .requested_stages()
            .iter()
            .all(|s| self.stages_completed.contains(s))
    }

    pub fn has_stage(&self, stage: AnalysisStage) -> bool {
        self.stages_completed.contains(&stage)
    }
}
