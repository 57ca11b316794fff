//! Track model
//!
//! File identity, tag metadata and derived features in one row. The content
//! hash is computed over audio sample data only and never changes for a
//! given track row; waveforms, jobs and stems key off it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A catalogued audio file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,

    // File identity
    pub file_path: String,
    pub file_size: i64,
    pub file_modified: Option<DateTime<Utc>>,
    pub content_hash: String,

    // Tag metadata
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i64>,
    pub track_no: Option<i64>,
    pub comment: Option<String>,

    // Derived features (absent until analysis lands)
    pub tempo: Option<f64>,
    pub musical_key: Option<i64>,
    pub mode: Option<i64>,
    pub time_signature: Option<i64>,
    pub beats: Option<Vec<f64>>,
    pub downbeats: Option<Vec<f64>>,
    pub first_beat_offset: Option<f64>,
    pub first_phrase_beat_no: Option<i64>,
    pub audible_start: Option<f64>,
    pub audible_end: Option<f64>,
    pub danceability: Option<bool>,
    pub acousticness: Option<bool>,
    pub instrumentalness: Option<bool>,
    pub valence: Option<f64>,
    pub arousal: Option<f64>,
    pub energy: Option<f64>,
    pub loudness: Option<f64>,
    pub spectral_centroid: Option<f64>,
    pub spectral_rolloff: Option<f64>,
    pub spectral_bandwidth: Option<f64>,
    pub zero_crossing_rate: Option<f64>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub analysis_version: Option<i64>,

    pub created_at: DateTime<Utc>,
}

impl Track {
    /// Minimal row as the library scanner creates it, pre-analysis
    pub fn new(file_path: String, file_size: i64, content_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path,
            file_size,
            file_modified: None,
            content_hash,
            title: None,
            artist: None,
            album: None,
            album_artist: None,
            genre: None,
            year: None,
            track_no: None,
            comment: None,
            tempo: None,
            musical_key: None,
            mode: None,
            time_signature: None,
            beats: None,
            downbeats: None,
            first_beat_offset: None,
            first_phrase_beat_no: None,
            audible_start: None,
            audible_end: None,
            danceability: None,
            acousticness: None,
            instrumentalness: None,
            valence: None,
            arousal: None,
            energy: None,
            loudness: None,
            spectral_centroid: None,
            spectral_rolloff: None,
            spectral_bandwidth: None,
            zero_crossing_rate: None,
            analyzed_at: None,
            analysis_version: None,
            created_at: Utc::now(),
        }
    }

    /// A track counts as analysed once basic features landed
    pub fn is_analyzed(&self) -> bool {
        self.tempo.is_some()
    }
}

/// Validate a beat grid: non-decreasing beats, downbeats a subsequence of
/// beats (within a small tolerance for float round-trips).
pub fn validate_beat_grid(beats: &[f64], downbeats: &[f64]) -> Result<(), String> {
    const EPS: f64 = 1e-6;

    if beats.windows(2).any(|w| w[1] + EPS < w[0]) {
        return Err("beats are not non-decreasing".to_string());
    }
    if downbeats.windows(2).any(|w| w[1] + EPS < w[0]) {
        return Err("downbeats are not non-decreasing".to_string());
    }

    let mut cursor = 0usize;
    for db in downbeats {
        match beats[cursor..].iter().position(|b| (b - db).abs() <= EPS) {
            Some(offset) => cursor += offset + 1,
            None => return Err(format!("downbeat {} is not a beat", db)),
        }
    }
    Ok(())
}
