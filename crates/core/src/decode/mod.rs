use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::{AudioVizError, Result};

/// A fully decoded audio file, mixed down to mono.
///
/// The playable handle for file mode is built around this buffer: the
/// output stream reads it at the playback cursor and the analyser taps the
/// same signal. Duration is known as soon as decoding completes, which is
/// the metadata-ready event of the source lifecycle.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Decodes the file at `path` into a mono sample buffer.
///
/// Any probe or codec failure, an unknown sample rate, or an empty track
/// surfaces as [`AudioVizError::Decode`]; a partially decodable file keeps
/// whatever packets decoded before the stream ended.
pub fn decode_file(path: impl AsRef<Path>) -> Result<DecodedAudio> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| AudioVizError::Decode(e.to_string()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension() {
        hint.with_extension(&ext.to_string_lossy());
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioVizError::Decode(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| AudioVizError::Decode("no audio track found".into()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioVizError::Decode("track reports no sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioVizError::Decode(e.to_string()))?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // End of stream or a truncated tail; keep what we have.
            Err(_) => break,
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Skip corrupt packets rather than failing the whole file.
            Err(_) => continue,
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let frames = decoded.frames();

        let mut buf = SampleBuffer::<f32>::new(frames as u64, spec);
        buf.copy_interleaved_ref(decoded);

        fold_to_mono(buf.samples(), channels, &mut samples);
    }

    if samples.is_empty() {
        return Err(AudioVizError::Decode("decoded no audio samples".into()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Averages interleaved frames into the mono output buffer.
pub(crate) fn fold_to_mono(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels == 0 {
        return;
    }
    for frame in interleaved.chunks_exact(channels) {
        let sum: f32 = frame.iter().sum();
        out.push(sum / channels as f32);
    }
}
