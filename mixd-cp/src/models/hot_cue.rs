//! Hot cue model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named position within a track
///
/// Source is `user` for cues set on the playback engine; imported cues carry
/// the name of the tool they came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotCue {
    pub track_id: Uuid,
    pub index: i64,
    /// Position in seconds from file start
    pub position: f64,
    /// Optional loop span end, seconds
    pub loop_end: Option<f64>,
    pub label: Option<String>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl HotCue {
    pub const SOURCE_USER: &'static str = "user";

    pub fn user(track_id: Uuid, index: i64, position: f64) -> Self {
        Self {
            track_id,
            index,
            position,
            loop_end: None,
            label: None,
            source: Self::SOURCE_USER.to_string(),
            created_at: Utc::now(),
        }
    }
}
