use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use serde::Serialize;

use crate::graph::{self, AudioContext, AudioGraph};
use crate::{
    AppConfig, AudioVizError, BeatDetector, DecodedAudio, FeatureExtractor, FeatureSnapshot,
    Result,
};

/// Which source is currently driving the analysis pipeline.
///
/// Exactly one is active at a time; transitioning to a new mode (or back to
/// `None`) tears the previous routing topology down completely first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    None,
    Microphone,
    File,
}

/// Transport state observed by the UI layer.
///
/// Mutated only by [`SourceManager`] in response to explicit calls or
/// source lifecycle events (decode-ready, stream end). `duration` is 0 for
/// live capture and while unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub is_loading: bool,
    pub volume: f32,
    pub duration: f32,
    pub current_time: f32,
}

struct DecodeEvent {
    generation: u64,
    result: Result<DecodedAudio>,
}

/// The state machine exposed to the UI.
///
/// Owns the graph lifecycle and mode transitions, playback, seeking and
/// volume control, and orchestrates the analyser, band extraction and beat
/// detection into one `get_features()` call polled at the display rate.
///
/// All state mutation happens on the caller's thread. File decoding runs on
/// a background thread and reports through a channel; a completion carries
/// the generation it was spawned under and is discarded wholesale if a
/// teardown has bumped the generation since, so a disconnect that races an
/// in-flight connection can never leak resources or write stale state.
pub struct SourceManager {
    config: AppConfig,
    mode: SourceMode,
    playback: PlaybackState,
    context: Option<AudioContext>,
    graph: Option<AudioGraph>,
    extractor: FeatureExtractor,
    beat: BeatDetector,
    features: FeatureSnapshot,
    generation: u64,
    last_error: Option<AudioVizError>,
    decode_tx: Sender<DecodeEvent>,
    decode_rx: Receiver<DecodeEvent>,
}

impl SourceManager {
    pub fn new(config: AppConfig) -> Self {
        let (decode_tx, decode_rx) = channel();
        let playback = PlaybackState {
            is_playing: false,
            is_loading: false,
            volume: config.audio.initial_volume,
            duration: 0.0,
            current_time: 0.0,
        };
        Self {
            extractor: FeatureExtractor::new(&config.analysis),
            beat: BeatDetector::new(&config.analysis),
            config,
            mode: SourceMode::None,
            playback,
            context: None,
            graph: None,
            features: FeatureSnapshot::default(),
            generation: 0,
            last_error: None,
            decode_tx,
            decode_rx,
        }
    }

    /// Connects the default capture device as the active source.
    ///
    /// Tears down whatever was connected before, then wires capture → gain
    /// → analyser. The analyser is never routed to the audible output in
    /// this mode. On failure the machine reverts to idle with no partial
    /// graph retained and the error is returned to the caller.
    pub fn connect_microphone(&mut self) -> Result<()> {
        self.disconnect_audio();
        self.last_error = None;
        self.playback.is_loading = true;

        let context = self.ensure_context();
        match graph::wire_capture(context) {
            Ok(wired) => {
                self.graph = Some(wired);
                self.mode = SourceMode::Microphone;
                self.playback.is_loading = false;
                self.playback.is_playing = true;
                self.beat.reset();
                tracing::info!("microphone connected");
                Ok(())
            }
            Err(e) => {
                self.playback.is_loading = false;
                tracing::warn!(%e, "microphone connection failed");
                Err(e)
            }
        }
    }

    /// Connects an audio file as the active source.
    ///
    /// Tears down whatever was connected before and starts a background
    /// decode; the machine stays in the loading state until the decode
    /// completes. Completion is observed through [`Self::get_features`] (or
    /// any later call that pumps events): on success the file graph is
    /// wired, duration becomes known and playback starts; on failure the
    /// machine stays loading and the error is surfaced via
    /// [`Self::last_error`].
    pub fn connect_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.disconnect_audio();
        self.last_error = None;
        self.playback.is_loading = true;
        self.ensure_context();

        let generation = self.generation;
        let sender = self.decode_tx.clone();
        tracing::info!(path = %path.display(), "decoding audio file");
        thread::spawn(move || {
            let result = crate::decode::decode_file(&path);
            // The receiver only disappears when the manager is dropped.
            let _ = sender.send(DecodeEvent { generation, result });
        });
        Ok(())
    }

    /// Tears down the active source and returns to idle.
    ///
    /// Releases every held resource on every path: the device stream is
    /// stopped and dropped, the decoded buffer released, the analyser
    /// cleared, and any in-flight connection attempt abandoned via the
    /// generation bump. Safe to call with no source connected; the state
    /// fields still reset.
    pub fn disconnect_audio(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(wired) = self.graph.take() {
            tracing::info!(mode = ?self.mode, "disconnecting audio source");
            drop(wired);
        }
        if let Some(context) = &self.context {
            if let Ok(mut analyser) = context.analyser.lock() {
                analyser.reset();
            }
        }
        self.mode = SourceMode::None;
        self.playback.is_playing = false;
        self.playback.is_loading = false;
        self.playback.duration = 0.0;
        self.playback.current_time = 0.0;
    }

    /// Toggles playback of the active source.
    ///
    /// File mode pauses or resumes the audible output; microphone mode has
    /// no discrete pause primitive, so the whole capture path is suspended
    /// and resumed instead. Either way the result is mirrored into
    /// `is_playing`. No-op while idle or loading.
    pub fn toggle_play(&mut self) {
        let Some(wired) = &self.graph else {
            return;
        };

        if self.playback.is_playing {
            match wired.pause() {
                Ok(()) => self.playback.is_playing = false,
                Err(e) => tracing::warn!(%e, "could not pause stream"),
            }
            return;
        }

        // Resuming a file that ran to the end restarts it from the top.
        if let AudioGraph::File { shared, .. } = wired {
            if shared.ended() {
                shared.set_position_samples(0.0);
                shared.set_ended(false);
                self.playback.current_time = 0.0;
            }
        }
        match wired.resume() {
            Ok(()) => self.playback.is_playing = true,
            Err(e) => tracing::warn!(%e, "could not resume stream"),
        }
    }

    /// Repositions file playback. Meaningful only in file mode; the target
    /// is clamped to `[0, duration]` and `current_time` reflects the
    /// clamped value immediately rather than waiting for the next poll.
    pub fn seek(&mut self, seconds: f32) {
        let Some(AudioGraph::File { shared, audio, .. }) = &self.graph else {
            return;
        };
        let clamped = clamp_seek_target(seconds, self.playback.duration);
        shared.set_position_samples(clamped as f64 * audio.sample_rate as f64);
        shared.set_ended(false);
        self.playback.current_time = clamped;
    }

    /// Sets the output level. One logical operation with two sinks: the
    /// shared gain stage always, and in file mode the playback element's
    /// own volume as well, so the two can never drift apart. The value is
    /// expected in `[0, 1]` (caller contract, not clamped here).
    pub fn set_volume(&mut self, volume: f32) {
        self.playback.volume = volume;
        if let Some(context) = &self.context {
            context.gain.set(volume);
        }
        if let Some(AudioGraph::File { shared, .. }) = &self.graph {
            shared.set_element_volume(volume);
        }
    }

    /// Computes and returns the feature snapshot for this display tick.
    ///
    /// Pumps pending decode completions, syncs playback time, pulls a fresh
    /// spectrum, extracts band energies and runs beat detection. Callable
    /// at any rate; before any source has connected this returns zeros with
    /// `is_beat` false, and between ticks the previous snapshot remains
    /// valid to read via [`Self::last_features`].
    pub fn get_features(&mut self) -> FeatureSnapshot {
        self.pump();
        self.sync_playback();

        let Some(context) = &self.context else {
            return self.features;
        };
        let pulled = match context.analyser.lock() {
            Ok(mut analyser) => analyser.pull(),
            Err(_) => return self.features,
        };
        let snapshot = match pulled {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(%e, "spectrum pull failed");
                return self.features;
            }
        };

        let (bass, mid, treble) = self.extractor.band_energies(&snapshot);
        let is_beat = self.beat.on_bass(bass);
        self.features = FeatureSnapshot {
            bass,
            mid,
            treble,
            is_beat,
        };
        self.features
    }

    /// The snapshot computed on the most recent tick.
    pub fn last_features(&self) -> FeatureSnapshot {
        self.features
    }

    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback
    }

    /// True once the shared processing context exists (first connect).
    pub fn is_ready(&self) -> bool {
        self.context.is_some()
    }

    /// The most recent asynchronous failure (decode or playback wiring),
    /// cleared by the next connect attempt.
    pub fn last_error(&self) -> Option<&AudioVizError> {
        self.last_error.as_ref()
    }

    fn ensure_context(&mut self) -> &AudioContext {
        if self.context.is_none() {
            tracing::debug!("creating audio processing context");
            self.context = Some(AudioContext::new(
                &self.config.analysis,
                self.playback.volume,
            ));
        }
        self.context.as_ref().expect("context must exist")
    }

    /// Drains decode completions, discarding any whose generation no longer
    /// matches (a teardown raced ahead of them).
    fn pump(&mut self) {
        while let Ok(event) = self.decode_rx.try_recv() {
            if event.generation != self.generation {
                tracing::debug!("discarding stale decode completion");
                continue;
            }
            match event.result {
                Ok(audio) => self.finish_file_connect(Arc::new(audio)),
                Err(e) => {
                    // Stay in the loading state rather than silently
                    // becoming connected; recovery is an explicit
                    // disconnect plus a fresh attempt.
                    tracing::warn!(%e, "audio file failed to decode");
                    self.last_error = Some(e);
                }
            }
        }
    }

    fn finish_file_connect(&mut self, audio: Arc<DecodedAudio>) {
        let Some(context) = &self.context else {
            return;
        };
        let wired = graph::wire_file(
            context,
            Arc::clone(&audio),
            self.playback.volume,
            self.config.audio.loop_playback,
        );
        match wired {
            Ok(wired) => {
                self.playback.duration = audio.duration_seconds();
                self.playback.current_time = 0.0;
                self.playback.is_loading = false;
                self.playback.is_playing = true;
                self.graph = Some(wired);
                self.mode = SourceMode::File;
                self.beat.reset();
                tracing::info!(duration = self.playback.duration, "file connected");
            }
            Err(e) => {
                tracing::warn!(%e, "could not open playback output");
                self.last_error = Some(e);
            }
        }
    }

    /// The per-tick time-sync step: active only while playing with a file
    /// handle present, it observes the playback cursor (and the stream-end
    /// latch) on every invocation instead of assuming continuity.
    fn sync_playback(&mut self) {
        if !self.playback.is_playing {
            return;
        }
        let Some(AudioGraph::File { shared, audio, .. }) = &self.graph else {
            return;
        };
        if shared.ended() {
            self.playback.current_time = self.playback.duration;
            self.playback.is_playing = false;
            tracing::debug!("file playback ended");
        } else {
            self.playback.current_time =
                (shared.position_samples() / audio.sample_rate as f64) as f32;
        }
    }
}

/// Seek targets are clamped to the playable range rather than rejected.
fn clamp_seek_target(seconds: f32, duration: f32) -> f32 {
    seconds.clamp(0.0, duration.max(0.0))
}

impl std::fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("mode", &self.mode)
            .field("playback", &self.playback)
            .field("ready", &self.is_ready())
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn manager() -> SourceManager {
        SourceManager::new(AppConfig::default())
    }

    fn pump_until(manager: &mut SourceManager, mut done: impl FnMut(&SourceManager) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            manager.get_features();
            if done(manager) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn features_are_zero_before_any_source_connects() {
        let mut m = manager();
        let features = m.get_features();
        assert_eq!(features, FeatureSnapshot::default());
        assert!(!features.is_beat);
        assert_eq!(m.mode(), SourceMode::None);
        assert!(!m.is_ready());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut m = manager();
        m.disconnect_audio();
        m.disconnect_audio();

        let playback = m.playback();
        assert!(!playback.is_playing);
        assert!(!playback.is_loading);
        assert_eq!(playback.duration, 0.0);
        assert_eq!(playback.current_time, 0.0);
        assert_eq!(m.mode(), SourceMode::None);
    }

    #[test]
    fn disconnect_preserves_the_volume_setting() {
        let mut m = manager();
        m.set_volume(0.9);
        m.disconnect_audio();
        assert!((m.playback().volume - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn transport_calls_are_no_ops_while_idle() {
        let mut m = manager();
        m.toggle_play();
        m.seek(42.0);

        let playback = m.playback();
        assert!(!playback.is_playing);
        assert_eq!(playback.current_time, 0.0);
    }

    #[test]
    fn failed_decode_surfaces_and_stays_loading() {
        let mut m = manager();
        m.connect_file("/no/such/audio/file.ogg").unwrap();
        assert!(m.playback().is_loading);
        assert!(m.is_ready());

        assert!(pump_until(&mut m, |m| m.last_error().is_some()));
        assert!(matches!(
            m.last_error(),
            Some(AudioVizError::Decode(_))
        ));
        // Never silently connected; still loading until the user acts.
        assert!(m.playback().is_loading);
        assert_eq!(m.mode(), SourceMode::None);

        m.disconnect_audio();
        assert!(!m.playback().is_loading);
    }

    #[test]
    fn stale_decode_completion_is_discarded_after_disconnect() {
        let mut m = manager();
        m.connect_file("/no/such/audio/file.ogg").unwrap();
        m.disconnect_audio();

        // Give the stale completion ample time to arrive, then pump.
        std::thread::sleep(Duration::from_millis(300));
        m.get_features();

        assert!(m.last_error().is_none());
        assert!(!m.playback().is_loading);
        assert_eq!(m.mode(), SourceMode::None);
    }

    #[test]
    fn features_stay_zero_with_a_context_but_no_source() {
        let mut m = manager();
        // A failed connect attempt still creates the shared context.
        m.connect_file("/no/such/audio/file.ogg").unwrap();
        pump_until(&mut m, |m| m.last_error().is_some());
        m.disconnect_audio();

        let features = m.get_features();
        assert_eq!(features.bass, 0.0);
        assert_eq!(features.mid, 0.0);
        assert_eq!(features.treble, 0.0);
        assert!(!features.is_beat);
    }

    #[test]
    fn last_features_returns_the_previous_snapshot_between_ticks() {
        let mut m = manager();
        let computed = m.get_features();
        assert_eq!(m.last_features(), computed);
    }

    #[test]
    fn seek_targets_clamp_to_the_playable_range() {
        assert_eq!(clamp_seek_target(-3.0, 10.0), 0.0);
        assert_eq!(clamp_seek_target(4.5, 10.0), 4.5);
        assert_eq!(clamp_seek_target(99.0, 10.0), 10.0);
        // Live sources report a zero duration, pinning every target to 0.
        assert_eq!(clamp_seek_target(5.0, 0.0), 0.0);
    }

    #[test]
    fn set_volume_is_legal_in_every_state() {
        let mut m = manager();
        m.set_volume(0.25);
        assert!((m.playback().volume - 0.25).abs() < f32::EPSILON);

        // Also legal once the shared context exists.
        m.connect_file("/no/such/audio/file.ogg").unwrap();
        assert!(m.is_ready());
        m.set_volume(0.75);
        assert!((m.playback().volume - 0.75).abs() < f32::EPSILON);
    }
}
