//! Worker callback payloads
//!
//! Per-stage result shapes posted by the feature-extraction worker. The
//! worker's field names are not stable across versions; every tolerated
//! alias (`tempo|bpm`, `key|musical_key`, `key_name|key`) is enumerated in
//! this module and nowhere else. The `key` alias is type-directed (a number
//! is the key index, a string is the key name), so extraction is done by
//! hand from the raw JSON rather than serde attributes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::AnalysisStage;
use super::track::validate_beat_grid;
use super::waveform::{Waveform, WaveformBands};

/// One rejected field in a malformed callback
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Stage discriminator on the callback wire: the six analysis stages plus
/// the worker's job-level control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStage {
    Analysis(AnalysisStage),
    JobCompleted,
    JobFailed,
    Error,
}

impl CallbackStage {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "job_completed" => Some(CallbackStage::JobCompleted),
            "job_failed" => Some(CallbackStage::JobFailed),
            "error" => Some(CallbackStage::Error),
            other => AnalysisStage::parse(other).map(CallbackStage::Analysis),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStage::Analysis(stage) => stage.as_str(),
            CallbackStage::JobCompleted => "job_completed",
            CallbackStage::JobFailed => "job_failed",
            CallbackStage::Error => "error",
        }
    }
}

/// Validated callback envelope: `{job_id, stage, status?, data}`
#[derive(Debug, Clone)]
pub struct CallbackEnvelope {
    /// Worker job id; equals the content hash of the audio
    pub job_id: String,
    pub stage: CallbackStage,
    pub status: Option<String>,
    pub data: Value,
}

impl CallbackEnvelope {
    pub fn from_value(body: &Value) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();

        let job_id = match body.get("job_id").and_then(Value::as_str) {
            Some(id) if mixd_common::hash::is_content_hash(id) => id.to_string(),
            Some(id) => {
                errors.push(FieldError::new(
                    "job_id",
                    format!("not a content hash: {:?}", id),
                ));
                String::new()
            }
            None => {
                errors.push(FieldError::new("job_id", "missing or not a string"));
                String::new()
            }
        };

        let stage = match body.get("stage").and_then(Value::as_str) {
            Some(s) => match CallbackStage::parse(s) {
                Some(stage) => Some(stage),
                None => {
                    errors.push(FieldError::new("stage", format!("unknown stage {:?}", s)));
                    None
                }
            },
            None => {
                errors.push(FieldError::new("stage", "missing or not a string"));
                None
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            job_id,
            stage: stage.expect("validated above"),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            data: body.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    /// Error text carried by `job_failed` / `error` callbacks
    pub fn error_message(&self) -> String {
        self.data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("worker reported failure")
            .to_string()
    }
}

// Alias-aware extraction helpers. Aliases are tried in declaration order.

fn number_field(data: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|n| data.get(n).and_then(Value::as_f64))
}

fn int_field(data: &Value, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|n| data.get(n).and_then(Value::as_i64))
}

fn string_field(data: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| data.get(n).and_then(Value::as_str))
        .map(str::to_string)
}

fn f64_array(data: &Value, name: &str) -> Result<Vec<f64>, FieldError> {
    match data.get(name) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| FieldError::new(name, "contains a non-numeric entry"))
            })
            .collect(),
        Some(_) => Err(FieldError::new(name, "not an array")),
    }
}

/// One waveform block inside a `basic_features` or `stems` callback
#[derive(Debug, Clone, Deserialize)]
pub struct WaveformData {
    pub zoom_level: u8,
    pub sample_rate: i64,
    pub samples_per_pixel: i64,
    pub num_pixels: i64,

    // Frequency-band arrays (non-stem waveforms)
    pub low_freq_amplitude: Option<Vec<f32>>,
    pub low_freq_intensity: Option<Vec<f32>>,
    pub mid_freq_amplitude: Option<Vec<f32>>,
    pub mid_freq_intensity: Option<Vec<f32>>,
    pub high_freq_amplitude: Option<Vec<f32>>,
    pub high_freq_intensity: Option<Vec<f32>>,

    // Per-stem arrays (stem waveforms)
    pub vocals_amplitude: Option<Vec<f32>>,
    pub vocals_intensity: Option<Vec<f32>>,
    pub drums_amplitude: Option<Vec<f32>>,
    pub drums_intensity: Option<Vec<f32>>,
    pub bass_amplitude: Option<Vec<f32>>,
    pub bass_intensity: Option<Vec<f32>>,
    pub other_amplitude: Option<Vec<f32>>,
    pub other_intensity: Option<Vec<f32>>,
}

impl WaveformData {
    /// Convert the wire block into a validated waveform record
    pub fn into_waveform(self, content_hash: &str) -> Result<Waveform, FieldError> {
        let bands = if self.vocals_amplitude.is_some() {
            WaveformBands::Stems {
                vocals_amplitude: self.vocals_amplitude.unwrap_or_default(),
                vocals_intensity: self.vocals_intensity.unwrap_or_default(),
                drums_amplitude: self.drums_amplitude.unwrap_or_default(),
                drums_intensity: self.drums_intensity.unwrap_or_default(),
                bass_amplitude: self.bass_amplitude.unwrap_or_default(),
                bass_intensity: self.bass_intensity.unwrap_or_default(),
                other_amplitude: self.other_amplitude.unwrap_or_default(),
                other_intensity: self.other_intensity.unwrap_or_default(),
            }
        } else {
            WaveformBands::Frequency {
                low_amplitude: self.low_freq_amplitude.unwrap_or_default(),
                low_intensity: self.low_freq_intensity.unwrap_or_default(),
                mid_amplitude: self.mid_freq_amplitude.unwrap_or_default(),
                mid_intensity: self.mid_freq_intensity.unwrap_or_default(),
                high_amplitude: self.high_freq_amplitude.unwrap_or_default(),
                high_intensity: self.high_freq_intensity.unwrap_or_default(),
            }
        };

        let waveform = Waveform {
            content_hash: content_hash.to_string(),
            zoom_level: self.zoom_level,
            sample_rate: self.sample_rate,
            samples_per_pixel: self.samples_per_pixel,
            num_pixels: self.num_pixels,
            bands,
        };
        waveform
            .validate()
            .map_err(|m| FieldError::new("waveforms", m))?;
        Ok(waveform)
    }
}

/// Validated `basic_features` payload
#[derive(Debug, Clone)]
pub struct BasicFeaturesData {
    pub tempo: f64,
    pub key: Option<i64>,
    pub key_name: Option<String>,
    pub mode: Option<i64>,
    pub mode_name: Option<String>,
    pub beats: Vec<f64>,
    pub downbeats: Vec<f64>,
    pub first_beat_offset: Option<f64>,
    pub first_phrase_beat_no: Option<i64>,
    pub audible_start: Option<f64>,
    pub audible_end: Option<f64>,
    pub waveforms: Vec<WaveformData>,
}

impl BasicFeaturesData {
    pub fn from_value(data: &Value) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();

        let tempo = number_field(data, &["tempo", "bpm"]);
        if tempo.is_none() {
            errors.push(FieldError::new("tempo", "missing (no tempo or bpm field)"));
        }

        let beats = f64_array(data, "beats").unwrap_or_else(|e| {
            errors.push(e);
            Vec::new()
        });
        let downbeats = f64_array(data, "downbeats").unwrap_or_else(|e| {
            errors.push(e);
            Vec::new()
        });
        if let Err(m) = validate_beat_grid(&beats, &downbeats) {
            errors.push(FieldError::new("beats", m));
        }

        let waveforms = match data.get("waveforms") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => match serde_json::from_value::<Vec<WaveformData>>(v.clone()) {
                Ok(list) => list,
                Err(e) => {
                    errors.push(FieldError::new("waveforms", e.to_string()));
                    Vec::new()
                }
            },
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        // key index is numeric; a string-typed `key` is the key name
        let key = int_field(data, &["key", "musical_key"]);
        let key_name = string_field(data, &["key_name", "key"]);

        Ok(Self {
            tempo: tempo.expect("validated above"),
            key,
            key_name,
            mode: int_field(data, &["mode"]),
            mode_name: string_field(data, &["mode_name"]),
            beats,
            downbeats,
            first_beat_offset: number_field(data, &["firstBeatOffset", "first_beat_offset"]),
            first_phrase_beat_no: int_field(data, &["firstPhraseBeatNo", "first_phrase_beat_no"]),
            audible_start: number_field(data, &["audibleStartTime", "audible_start_time"]),
            audible_end: number_field(data, &["audibleEndTime", "audible_end_time"]),
            waveforms,
        })
    }
}

/// Validated `characteristics` payload
#[derive(Debug, Clone)]
pub struct CharacteristicsData {
    pub danceability: bool,
    pub acousticness: bool,
    pub instrumentalness: bool,
    pub valence: f64,
    pub arousal: f64,
    pub energy: f64,
    pub loudness: f64,
    pub spectral_centroid: f64,
    pub spectral_rolloff: f64,
    pub spectral_bandwidth: Option<f64>,
    pub zero_crossing_rate: f64,
}

impl CharacteristicsData {
    pub fn from_value(data: &Value) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();

        let bool_field = |name: &str, errors: &mut Vec<FieldError>| match data
            .get(name)
            .and_then(Value::as_bool)
        {
            Some(b) => b,
            None => {
                errors.push(FieldError::new(name, "missing or not a boolean"));
                false
            }
        };
        let required = |name: &str, errors: &mut Vec<FieldError>| match data
            .get(name)
            .and_then(Value::as_f64)
        {
            Some(v) => v,
            None => {
                errors.push(FieldError::new(name, "missing or not a number"));
                0.0
            }
        };

        let parsed = Self {
            danceability: bool_field("danceability", &mut errors),
            acousticness: bool_field("acousticness", &mut errors),
            instrumentalness: bool_field("instrumentalness", &mut errors),
            valence: required("valence", &mut errors),
            arousal: required("arousal", &mut errors),
            energy: required("energy", &mut errors),
            loudness: required("loudness", &mut errors),
            spectral_centroid: required("spectral_centroid", &mut errors),
            spectral_rolloff: required("spectral_rolloff", &mut errors),
            spectral_bandwidth: number_field(data, &["spectral_bandwidth"]),
            zero_crossing_rate: required("zero_crossing_rate", &mut errors),
        };

        if errors.is_empty() {
            Ok(parsed)
        } else {
            Err(errors)
        }
    }
}

/// How a stems callback hands over the audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StemDelivery {
    /// Shared-filesystem paths (local worker)
    Paths,
    /// HTTP URLs to download (remote worker)
    Urls,
    /// Base64-encoded bytes (remote worker, legacy)
    Base64,
}

/// Validated `stems` payload
#[derive(Debug, Clone)]
pub struct StemsData {
    pub delivery: StemDelivery,
    /// Container format of the delivered audio ("wav" needs no conversion)
    pub format: Option<String>,
    /// stem name → path | URL | base64 blob
    pub stems: HashMap<String, String>,
    pub waveforms: Vec<WaveformData>,
    pub processing_time: Option<f64>,
}

/// The four stem names every set must carry
pub const STEM_NAMES: [&str; 4] = ["vocals", "drums", "bass", "other"];

impl StemsData {
    pub fn from_value(data: &Value) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();

        let mode = data
            .get("delivery_mode")
            .and_then(Value::as_str)
            .unwrap_or("path");
        if !matches!(mode, "path" | "callback") {
            errors.push(FieldError::new(
                "delivery_mode",
                format!("unknown mode {:?}", mode),
            ));
        }

        let stems: HashMap<String, String> = match data.get("stems") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => {
                errors.push(FieldError::new("stems", "missing or not an object"));
                HashMap::new()
            }
        };
        for name in STEM_NAMES {
            if !stems.contains_key(name) {
                errors.push(FieldError::new("stems", format!("missing stem {:?}", name)));
            }
        }

        let waveforms = match data.get("waveforms") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => match serde_json::from_value::<Vec<WaveformData>>(v.clone()) {
                Ok(list) => list,
                Err(e) => {
                    errors.push(FieldError::new("waveforms", e.to_string()));
                    Vec::new()
                }
            },
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        // Within "callback" mode the worker sends either URLs or raw base64;
        // only the value shape tells them apart.
        let delivery = if mode == "path" {
            StemDelivery::Paths
        } else if stems
            .values()
            .all(|v| v.starts_with("http://") || v.starts_with("https://"))
        {
            StemDelivery::Urls
        } else {
            StemDelivery::Base64
        };

        Ok(Self {
            delivery,
            format: data
                .get("format")
                .and_then(Value::as_str)
                .map(str::to_string),
            stems,
            waveforms,
            processing_time: number_field(data, &["processing_time"]),
        })
    }

    /// Whether the delivered container format already is normalised PCM
    pub fn is_normalized(&self) -> bool {
        match self.format.as_deref() {
            None | Some("wav") => true,
            Some(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_requires_content_hash_job_id() {
        let err = CallbackEnvelope::from_value(&json!({
            "job_id": "short",
            "stage": "basic_features",
            "data": {},
        }))
        .unwrap_err();
        assert_eq!(err[0].field, "job_id");
    }

    #[test]
    fn envelope_rejects_unknown_stage() {
        let err = CallbackEnvelope::from_value(&json!({
            "job_id": "a".repeat(64),
            "stage": "tempo_map",
            "data": {},
        }))
        .unwrap_err();
        assert_eq!(err[0].field, "stage");
    }

    #[test]
    fn tempo_alias_bpm_is_honoured() {
        let data = json!({"bpm": 174.0, "beats": [], "downbeats": []});
        let parsed = BasicFeaturesData::from_value(&data).unwrap();
        assert_eq!(parsed.tempo, 174.0);
    }

    #[test]
    fn key_alias_is_type_directed() {
        // Numeric `key` is the index; string `key` is the name.
        let numeric = BasicFeaturesData::from_value(&json!({
            "tempo": 128.0, "key": 5, "key_name": "F",
        }))
        .unwrap();
        assert_eq!(numeric.key, Some(5));
        assert_eq!(numeric.key_name.as_deref(), Some("F"));

        let stringly = BasicFeaturesData::from_value(&json!({
            "tempo": 128.0, "musical_key": 5, "key": "F",
        }))
        .unwrap();
        assert_eq!(stringly.key, Some(5));
        assert_eq!(stringly.key_name.as_deref(), Some("F"));
    }

    #[test]
    fn camel_case_offsets_are_accepted() {
        let parsed = BasicFeaturesData::from_value(&json!({
            "tempo": 120.0,
            "firstBeatOffset": 0.468,
            "firstPhraseBeatNo": 9,
            "audibleStartTime": 0.1,
            "audibleEndTime": 212.4,
        }))
        .unwrap();
        assert_eq!(parsed.first_beat_offset, Some(0.468));
        assert_eq!(parsed.first_phrase_beat_no, Some(9));
        assert_eq!(parsed.audible_start, Some(0.1));
        assert_eq!(parsed.audible_end, Some(212.4));
    }

    #[test]
    fn invalid_beat_grid_is_rejected() {
        let err = BasicFeaturesData::from_value(&json!({
            "tempo": 120.0,
            "beats": [1.0, 0.5],
        }))
        .unwrap_err();
        assert_eq!(err[0].field, "beats");
    }

    #[test]
    fn characteristics_reports_every_missing_field() {
        let err = CharacteristicsData::from_value(&json!({"valence": 0.5})).unwrap_err();
        let fields: Vec<_> = err.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"danceability"));
        assert!(fields.contains(&"energy"));
        assert!(!fields.contains(&"valence"));
    }

    #[test]
    fn stems_payload_requires_all_four_names() {
        let err = StemsData::from_value(&json!({
            "delivery_mode": "path",
            "stems": {"vocals": "/v.wav", "drums": "/d.wav", "bass": "/b.wav"},
        }))
        .unwrap_err();
        assert!(err.iter().any(|e| e.message.contains("other")));
    }

    #[test]
    fn callback_mode_classifies_urls_vs_base64() {
        let urls = StemsData::from_value(&json!({
            "delivery_mode": "callback",
            "format": "flac",
            "stems": {
                "vocals": "http://w/v", "drums": "http://w/d",
                "bass": "http://w/b", "other": "http://w/o",
            },
        }))
        .unwrap();
        assert_eq!(urls.delivery, StemDelivery::Urls);
        assert!(!urls.is_normalized());

        let b64 = StemsData::from_value(&json!({
            "delivery_mode": "callback",
            "stems": {
                "vocals": "UklGRg==", "drums": "UklGRg==",
                "bass": "UklGRg==", "other": "UklGRg==",
            },
        }))
        .unwrap();
        assert_eq!(b64.delivery, StemDelivery::Base64);
    }
}
