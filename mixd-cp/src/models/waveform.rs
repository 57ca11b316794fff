//! Waveform model
//!
//! Precomputed amplitude/intensity summaries at three zoom levels, keyed by
//! (content hash, zoom, stems flag) so duplicate tracks share payloads.

use serde::{Deserialize, Serialize};

/// Band arrays for one waveform record
///
/// Non-stem waveforms carry three frequency bands, stem waveforms one band
/// per stem. Every array must have `num_pixels` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaveformBands {
    Frequency {
        low_amplitude: Vec<f32>,
        low_intensity: Vec<f32>,
        mid_amplitude: Vec<f32>,
        mid_intensity: Vec<f32>,
        high_amplitude: Vec<f32>,
        high_intensity: Vec<f32>,
    },
    Stems {
        vocals_amplitude: Vec<f32>,
        vocals_intensity: Vec<f32>,
        drums_amplitude: Vec<f32>,
        drums_intensity: Vec<f32>,
        bass_amplitude: Vec<f32>,
        bass_intensity: Vec<f32>,
        other_amplitude: Vec<f32>,
        other_intensity: Vec<f32>,
    },
}

impl WaveformBands {
    fn arrays(&self) -> Vec<&Vec<f32>> {
        match self {
            WaveformBands::Frequency {
                low_amplitude,
                low_intensity,
                mid_amplitude,
                mid_intensity,
                high_amplitude,
                high_intensity,
            } => vec![
                low_amplitude,
                low_intensity,
                mid_amplitude,
                mid_intensity,
                high_amplitude,
                high_intensity,
            ],
            WaveformBands::Stems {
                vocals_amplitude,
                vocals_intensity,
                drums_amplitude,
                drums_intensity,
                bass_amplitude,
                bass_intensity,
                other_amplitude,
                other_intensity,
            } => vec![
                vocals_amplitude,
                vocals_intensity,
                drums_amplitude,
                drums_intensity,
                bass_amplitude,
                bass_intensity,
                other_amplitude,
                other_intensity,
            ],
        }
    }

    pub fn is_stems(&self) -> bool {
        matches!(self, WaveformBands::Stems { .. })
    }
}

/// One stored waveform record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub content_hash: String,
    /// 0 = overview, 1 = normal, 2 = detailed
    pub zoom_level: u8,
    pub sample_rate: i64,
    pub samples_per_pixel: i64,
    pub num_pixels: i64,
    pub bands: WaveformBands,
}

impl Waveform {
    pub const MAX_ZOOM: u8 = 2;

    /// Check the length invariant: every band array spans num_pixels
    pub fn validate(&self) -> Result<(), String> {
        if self.zoom_level > Self::MAX_ZOOM {
            return Err(format!("zoom level {} out of range", self.zoom_level));
        }
        for (i, array) in self.bands.arrays().into_iter().enumerate() {
            if array.len() as i64 != self.num_pixels {
                return Err(format!(
                    "band array {} has {} entries, expected {}",
                    i,
                    array.len(),
                    self.num_pixels
                ));
            }
        }
        Ok(())
    }

    pub fn for_stems(&self) -> bool {
        self.bands.is_stems()
    }
}
