//! Audio source & analysis engine for the Audio Visualiser application.
//!
//! The crate manages two mutually exclusive audio sources (live microphone
//! capture and file playback) and feeds whichever is active through a
//! shared gain stage into a spectral analyser. Once per display tick the
//! renderer pulls a [`FeatureSnapshot`] of normalised bass/mid/treble
//! energies and beat onsets via [`SourceManager::get_features`]. Each module
//! owns a distinct subsystem (routing topology, spectral analysis, feature
//! extraction, beat detection, file decoding) behind the [`SourceManager`]
//! state machine.

pub mod beat;
pub mod config;
pub mod decode;
pub mod error;
pub mod features;
pub mod graph;
pub mod source;
pub mod spectrum;

pub use beat::BeatDetector;
pub use config::{AnalysisConfig, AppConfig, AudioConfig};
pub use decode::DecodedAudio;
pub use error::{AudioVizError, Result};
pub use features::{FeatureExtractor, FeatureSnapshot};
pub use graph::{AudioContext, AudioGraph, GainStage, PlaybackShared};
pub use source::{PlaybackState, SourceManager, SourceMode};
pub use spectrum::{SpectrumSnapshot, SpectrumSource};
