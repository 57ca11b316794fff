//! Domain models for the control plane

pub mod callback;
pub mod hot_cue;
pub mod job;
pub mod track;
pub mod waveform;

pub use callback::{
    BasicFeaturesData, CallbackEnvelope, CallbackStage, CharacteristicsData, StemDelivery,
    StemsData, WaveformData,
};
pub use hot_cue::HotCue;
pub use job::{
    AnalysisJob, AnalysisOptions, AnalysisStage, DeliveryHook, HookKind, JobPriority, JobStatus,
};
pub use track::Track;
pub use waveform::{Waveform, WaveformBands};
