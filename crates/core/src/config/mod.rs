use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl AppConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::AudioVizError::msg(e.to_string()))
    }
}

/// Configuration for the source and playback side of the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Output level applied until the user moves the volume control.
    pub initial_volume: f32,
    /// Whether file playback wraps to the start when it reaches the end.
    pub loop_playback: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            initial_volume: 0.5,
            loop_playback: true,
        }
    }
}

/// Configuration for the spectral analyser and the feature extraction built
/// on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Transform size of the analyser; the spectrum has `fft_size / 2` bins.
    pub fft_size: usize,
    /// Per-bin temporal smoothing factor in `[0, 1)`. 0 disables smoothing.
    pub smoothing_time_constant: f32,
    /// Decibel value mapped to byte 0.
    pub min_decibels: f32,
    /// Decibel value mapped to byte 255.
    pub max_decibels: f32,
    /// Upper edge of the bass band in Hz.
    pub bass_edge_hz: f32,
    /// Upper edge of the mid band in Hz.
    pub mid_edge_hz: f32,
    /// Number of bass-energy samples the beat detector remembers.
    pub beat_history: usize,
    /// A beat requires the bass energy to exceed the local average times
    /// this ratio.
    pub beat_ratio: f32,
    /// A beat additionally requires the bass energy to exceed this absolute
    /// floor, suppressing onsets in near-silence.
    pub beat_floor: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: 512,
            smoothing_time_constant: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            bass_edge_hz: 250.0,
            mid_edge_hz: 4000.0,
            beat_history: 60,
            beat_ratio: 1.5,
            beat_floor: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_analyser_configuration() {
        let config = AppConfig::default();
        assert_eq!(config.analysis.fft_size, 512);
        assert!((config.analysis.smoothing_time_constant - 0.8).abs() < f32::EPSILON);
        assert!((config.audio.initial_volume - 0.5).abs() < f32::EPSILON);
        assert!(config.audio.loop_playback);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = AppConfig::from_json(r#"{"audio": {"initial_volume": 1.0, "loop_playback": false}}"#)
            .expect("config should parse");
        assert!((config.audio.initial_volume - 1.0).abs() < f32::EPSILON);
        assert!(!config.audio.loop_playback);
        assert_eq!(config.analysis.fft_size, 512);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(AppConfig::from_json("{not json").is_err());
    }
}
