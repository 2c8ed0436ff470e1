use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;

use crate::{AnalysisConfig, AudioVizError, DecodedAudio, Result, SpectrumSource};

/// The gain stage shared by every routing topology.
///
/// Written by the control surface, read by the stream callbacks; the value
/// is stored as raw bits so neither side ever blocks the other.
#[derive(Debug)]
pub struct GainStage {
    bits: AtomicU32,
}

impl GainStage {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Transport state shared between the control surface and the file-mode
/// output callback: fractional playback cursor (in source samples), the
/// playback element's own volume, the loop flag, and the stream-end latch.
pub struct PlaybackShared {
    cursor_bits: AtomicU64,
    element_volume_bits: AtomicU32,
    looping: AtomicBool,
    ended: AtomicBool,
}

impl PlaybackShared {
    pub fn new(element_volume: f32, looping: bool) -> Self {
        Self {
            cursor_bits: AtomicU64::new(0.0f64.to_bits()),
            element_volume_bits: AtomicU32::new(element_volume.to_bits()),
            looping: AtomicBool::new(looping),
            ended: AtomicBool::new(false),
        }
    }

    pub fn position_samples(&self) -> f64 {
        f64::from_bits(self.cursor_bits.load(Ordering::Relaxed))
    }

    pub fn set_position_samples(&self, samples: f64) {
        self.cursor_bits.store(samples.to_bits(), Ordering::Relaxed);
    }

    pub fn element_volume(&self) -> f32 {
        f32::from_bits(self.element_volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_element_volume(&self, volume: f32) {
        self.element_volume_bits
            .store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Relaxed)
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::Relaxed)
    }

    pub fn set_ended(&self, ended: bool) {
        self.ended.store(ended, Ordering::Relaxed);
    }
}

impl fmt::Debug for PlaybackShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackShared")
            .field("position_samples", &self.position_samples())
            .field("element_volume", &self.element_volume())
            .field("looping", &self.looping())
            .field("ended", &self.ended())
            .finish()
    }
}

/// The lazily created processing context: one gain stage and one analysis
/// node, created on the first connect and re-wired (never recreated) across
/// every reconnect after that.
#[derive(Debug)]
pub struct AudioContext {
    pub gain: Arc<GainStage>,
    pub analyser: Arc<Mutex<SpectrumSource>>,
}

impl AudioContext {
    pub fn new(config: &AnalysisConfig, initial_volume: f32) -> Self {
        Self {
            gain: Arc::new(GainStage::new(initial_volume)),
            analyser: Arc::new(Mutex::new(SpectrumSource::new(config))),
        }
    }

    fn lock_analyser(&self) -> Result<std::sync::MutexGuard<'_, SpectrumSource>> {
        self.analyser
            .lock()
            .map_err(|_| AudioVizError::msg("analysis node has been poisoned"))
    }
}

/// The routing topology of the active source.
///
/// Exactly one source exists at a time, and only the `File` variant owns an
/// audible output path: live capture is structurally incapable of being
/// routed back to the speakers, which is the feedback-prevention invariant.
/// Dropping the graph stops the underlying device stream and releases it.
pub enum AudioGraph {
    /// capture device -> gain -> analyser
    Capture {
        stream: cpal::Stream,
        sample_rate: u32,
    },
    /// decoded buffer -> element volume -> gain -> analyser tap + output
    File {
        stream: cpal::Stream,
        shared: Arc<PlaybackShared>,
        audio: Arc<DecodedAudio>,
    },
}

impl AudioGraph {
    /// Suspends the underlying stream; for capture this is the whole
    /// processing path, for file playback the audible output.
    pub fn pause(&self) -> Result<()> {
        self.stream()
            .pause()
            .map_err(|e| AudioVizError::msg(e.to_string()))
    }

    /// Resumes a suspended stream.
    pub fn resume(&self) -> Result<()> {
        self.stream()
            .play()
            .map_err(|e| AudioVizError::msg(e.to_string()))
    }

    fn stream(&self) -> &cpal::Stream {
        match self {
            AudioGraph::Capture { stream, .. } => stream,
            AudioGraph::File { stream, .. } => stream,
        }
    }
}

impl fmt::Debug for AudioGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioGraph::Capture { sample_rate, .. } => f
                .debug_struct("AudioGraph::Capture")
                .field("sample_rate", sample_rate)
                .finish(),
            AudioGraph::File { shared, audio, .. } => f
                .debug_struct("AudioGraph::File")
                .field("shared", shared)
                .field("duration", &audio.duration_seconds())
                .finish(),
        }
    }
}

/// Builds the live-capture topology on the default input device.
///
/// The analyser is re-pointed at the capture rate and cleared before the
/// stream starts, and is never wired to any output. Every failure maps to
/// [`AudioVizError::CaptureUnavailable`] and leaves nothing behind.
pub fn wire_capture(context: &AudioContext) -> Result<AudioGraph> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioVizError::CaptureUnavailable("no capture device found".into()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| AudioVizError::CaptureUnavailable(e.to_string()))?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    {
        let mut analyser = context.lock_analyser()?;
        analyser.set_sample_rate(sample_rate);
        analyser.reset();
    }

    let stream = match sample_format {
        SampleFormat::F32 => build_capture_stream::<f32>(&device, &config, channels, context),
        SampleFormat::I16 => build_capture_stream::<i16>(&device, &config, channels, context),
        SampleFormat::U16 => build_capture_stream::<u16>(&device, &config, channels, context),
        other => Err(AudioVizError::CaptureUnavailable(format!(
            "unsupported capture sample format {other:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| AudioVizError::CaptureUnavailable(e.to_string()))?;

    tracing::info!(sample_rate, channels, "capture graph wired");
    Ok(AudioGraph::Capture {
        stream,
        sample_rate,
    })
}

fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    context: &AudioContext,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let gain = Arc::clone(&context.gain);
    let analyser = Arc::clone(&context.analyser);
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                downmix_into(data, channels, gain.get(), &mut mono);
                if let Ok(mut analyser) = analyser.lock() {
                    analyser.push_samples(&mono);
                }
            },
            |err| tracing::warn!(%err, "capture stream error"),
            None,
        )
        .map_err(|e| AudioVizError::CaptureUnavailable(e.to_string()))
}

/// Builds the file-playback topology on the default output device.
///
/// The output callback reads the decoded buffer at the playback cursor,
/// applies element volume and the gain stage, writes the result to the
/// device, and taps the identical signal into the analyser, so the analyser
/// sees exactly what is heard. Failures map to [`AudioVizError::Playback`].
pub fn wire_file(
    context: &AudioContext,
    audio: Arc<DecodedAudio>,
    element_volume: f32,
    looping: bool,
) -> Result<AudioGraph> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioVizError::Playback("no output device found".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioVizError::Playback(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(AudioVizError::Playback(format!(
            "unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }

    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let config: cpal::StreamConfig = supported.into();

    // The analyser sees the resampled tap, so it runs at the device rate.
    {
        let mut analyser = context.lock_analyser()?;
        analyser.set_sample_rate(device_rate);
        analyser.reset();
    }

    let shared = Arc::new(PlaybackShared::new(element_volume, looping));
    let step = audio.sample_rate as f64 / device_rate as f64;

    let gain = Arc::clone(&context.gain);
    let analyser = Arc::clone(&context.analyser);
    let cb_shared = Arc::clone(&shared);
    let cb_audio = Arc::clone(&audio);
    let mut tap: Vec<f32> = Vec::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render_file_block(&cb_shared, &cb_audio, &gain, step, channels, data, &mut tap);
                if let Ok(mut analyser) = analyser.lock() {
                    analyser.push_samples(&tap);
                }
            },
            |err| tracing::warn!(%err, "playback stream error"),
            None,
        )
        .map_err(|e| AudioVizError::Playback(e.to_string()))?;
    stream
        .play()
        .map_err(|e| AudioVizError::Playback(e.to_string()))?;

    tracing::info!(
        device_rate,
        channels,
        duration = audio.duration_seconds(),
        "file graph wired"
    );
    Ok(AudioGraph::File {
        stream,
        shared,
        audio,
    })
}

/// Averages interleaved frames to mono, converts to f32 and applies the
/// gain level. Kept free of any device types so the capture path's signal
/// handling is testable without hardware.
pub(crate) fn downmix_into<T>(data: &[T], channels: usize, level: f32, out: &mut Vec<f32>)
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    if channels == 0 {
        return;
    }
    for frame in data.chunks_exact(channels) {
        let mut sum = 0.0f32;
        for &sample in frame {
            let value: f32 = cpal::Sample::from_sample(sample);
            sum += value;
        }
        out.push(sum / channels as f32 * level);
    }
}

/// Body of the file-mode output callback, kept free of any device types.
///
/// Advances the fractional cursor by `step` source samples per device frame
/// (linear interpolation), wraps or latches `ended` at the end of the
/// buffer, writes the post-gain signal to every device channel and mirrors
/// it into `tap` for the analyser.
pub(crate) fn render_file_block(
    shared: &PlaybackShared,
    audio: &DecodedAudio,
    gain: &GainStage,
    step: f64,
    channels: usize,
    out: &mut [f32],
    tap: &mut Vec<f32>,
) {
    tap.clear();
    if channels == 0 {
        return;
    }

    let level = shared.element_volume() * gain.get();
    let len = audio.samples.len() as f64;
    let mut cursor = shared.position_samples();
    let mut ended = shared.ended();

    for frame in out.chunks_exact_mut(channels) {
        let sample = if ended {
            0.0
        } else {
            sample_at(&audio.samples, cursor) * level
        };
        for slot in frame {
            *slot = sample;
        }
        tap.push(sample);

        if !ended {
            cursor += step;
            if cursor >= len {
                if shared.looping() {
                    cursor -= len;
                } else {
                    cursor = len;
                    ended = true;
                }
            }
        }
    }

    shared.set_position_samples(cursor);
    if ended {
        shared.set_ended(true);
    }
}

/// Linear interpolation into the mono sample buffer.
fn sample_at(samples: &[f32], cursor: f64) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let index = cursor as usize;
    if index + 1 >= samples.len() {
        return samples[samples.len() - 1];
    }
    let fraction = (cursor - index as f64) as f32;
    let a = samples[index];
    let b = samples[index + 1];
    a + (b - a) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(samples: Vec<f32>) -> DecodedAudio {
        DecodedAudio {
            samples,
            sample_rate: 48_000,
        }
    }

    #[test]
    fn gain_stage_roundtrips() {
        let gain = GainStage::new(0.5);
        assert!((gain.get() - 0.5).abs() < f32::EPSILON);
        gain.set(0.0);
        assert_eq!(gain.get(), 0.0);
    }

    #[test]
    fn playback_shared_roundtrips_the_cursor() {
        let shared = PlaybackShared::new(1.0, false);
        shared.set_position_samples(1234.5);
        assert!((shared.position_samples() - 1234.5).abs() < f64::EPSILON);
    }

    #[test]
    fn downmix_averages_frames_and_applies_the_level() {
        let mut out = Vec::new();
        downmix_into(&[1.0f32, 0.0, -0.5, 0.5], 2, 0.5, &mut out);
        assert_eq!(out, vec![0.25, 0.0]);
    }

    #[test]
    fn downmix_at_zero_level_is_silent() {
        let mut out = Vec::new();
        downmix_into(&[1.0f32, 1.0, 1.0, 1.0], 2, 0.0, &mut out);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn rendering_applies_both_volume_sinks_to_every_channel() {
        let audio = audio(vec![0.5; 8]);
        let shared = PlaybackShared::new(0.5, false);
        let gain = GainStage::new(0.5);
        let mut out = vec![9.0f32; 8]; // 4 stereo frames
        let mut tap = Vec::new();

        render_file_block(&shared, &audio, &gain, 1.0, 2, &mut out, &mut tap);

        // 0.5 sample * 0.5 element volume * 0.5 gain on both channels.
        assert!(out.iter().all(|&s| (s - 0.125).abs() < 1e-6));
        assert_eq!(tap.len(), 4);
        assert!((shared.position_samples() - 4.0).abs() < f64::EPSILON);
        assert!(!shared.ended());
    }

    #[test]
    fn zero_volume_silences_output_and_analysis_tap() {
        let audio = audio(vec![1.0; 8]);
        let shared = PlaybackShared::new(0.0, false);
        let gain = GainStage::new(1.0);
        let mut out = vec![9.0f32; 4];
        let mut tap = Vec::new();

        render_file_block(&shared, &audio, &gain, 1.0, 1, &mut out, &mut tap);

        // The analyser taps post-gain, so muting blanks the features too.
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(tap.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn looping_playback_wraps_the_cursor() {
        let audio = audio(vec![1.0; 4]);
        let shared = PlaybackShared::new(1.0, true);
        let gain = GainStage::new(1.0);
        let mut out = vec![0.0f32; 10];
        let mut tap = Vec::new();

        render_file_block(&shared, &audio, &gain, 1.0, 1, &mut out, &mut tap);

        assert!(!shared.ended());
        assert!((shared.position_samples() - 2.0).abs() < f64::EPSILON);
        assert!(out.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn non_looping_playback_latches_ended_and_goes_silent() {
        let audio = audio(vec![1.0; 4]);
        let shared = PlaybackShared::new(1.0, false);
        let gain = GainStage::new(1.0);
        let mut out = vec![9.0f32; 8];
        let mut tap = Vec::new();

        render_file_block(&shared, &audio, &gain, 1.0, 1, &mut out, &mut tap);

        assert!(shared.ended());
        // The cursor parks at the end of the buffer.
        assert!((shared.position_samples() - 4.0).abs() < f64::EPSILON);
        assert!(out[..4].iter().all(|&s| s > 0.0));
        assert!(out[4..].iter().all(|&s| s == 0.0));

        // Seeking back clears the latch and playback resumes.
        shared.set_ended(false);
        shared.set_position_samples(0.0);
        render_file_block(&shared, &audio, &gain, 1.0, 1, &mut out, &mut tap);
        assert!(out[0] > 0.0);
    }

    #[test]
    fn fractional_steps_interpolate_between_samples() {
        let audio = audio(vec![0.0, 1.0]);
        let shared = PlaybackShared::new(1.0, false);
        let gain = GainStage::new(1.0);
        let mut out = vec![0.0f32; 3];
        let mut tap = Vec::new();

        render_file_block(&shared, &audio, &gain, 0.5, 1, &mut out, &mut tap);

        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }
}
