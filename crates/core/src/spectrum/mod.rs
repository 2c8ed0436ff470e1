use std::{collections::VecDeque, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{AnalysisConfig, Result};

/// One instantaneous frequency-magnitude reading of the active signal.
///
/// Holds `fft_size / 2` magnitudes scaled to `0..=255` plus the sample rate
/// they were measured at, so consumers can map bins back to frequencies.
/// Regenerated fresh on every pull and never reused across ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectrumSnapshot {
    bins: Vec<u8>,
    sample_rate: u32,
}

impl SpectrumSnapshot {
    pub fn new(bins: Vec<u8>, sample_rate: u32) -> Self {
        Self { bins, sample_rate }
    }

    pub fn bins(&self) -> &[u8] {
        &self.bins
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }
}

/// The analysis node of the routing topology.
///
/// Wraps a ring of the most recent post-gain mono samples and can be pulled
/// for a fresh [`SpectrumSnapshot`] at any time: the ring is windowed,
/// transformed, temporally smoothed per bin, and converted from decibels to
/// bytes over the configured range. Writers are the stream callbacks; the
/// reader is the per-tick feature pull.
pub struct SpectrumSource {
    fft_size: usize,
    sample_rate: u32,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
    ring: VecDeque<f32>,
    smoothed: Vec<f32>,
    fft: FftResources,
}

impl SpectrumSource {
    pub fn new(config: &AnalysisConfig) -> Self {
        let fft_size = config.fft_size.max(2);
        let mut planner = RealFftPlanner::new();
        let plan = planner.plan_fft_forward(fft_size);
        let fft = FftResources {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };

        Self {
            fft_size,
            sample_rate: 0,
            smoothing: config.smoothing_time_constant.clamp(0.0, 0.999),
            min_db: config.min_decibels,
            max_db: config.max_decibels,
            ring: VecDeque::with_capacity(fft_size),
            smoothed: vec![0.0; fft_size / 2],
            fft,
        }
    }

    /// Number of bins in every snapshot this source produces.
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Records the sample rate of the graph currently feeding the ring.
    /// Called on every wire-up so band mapping tracks the active source.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    /// Drops all buffered samples and smoothing state so a newly wired
    /// source never inherits the previous source's spectrum.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.smoothed.fill(0.0);
    }

    /// Appends samples to the ring, evicting the oldest beyond `fft_size`.
    pub fn push_samples(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.ring.len() == self.fft_size {
                self.ring.pop_front();
            }
            self.ring.push_back(sample);
        }
    }

    /// Produces a fresh snapshot of the current frequency content.
    pub fn pull(&mut self) -> Result<SpectrumSnapshot> {
        let n = self.fft_size;

        // Zero-pad at the front until the ring has filled once.
        self.fft.input.fill(0.0);
        let offset = n - self.ring.len();
        for (i, &sample) in self.ring.iter().enumerate() {
            self.fft.input[offset + i] = sample * hann_value(offset + i, n);
        }

        self.fft.plan.process_with_scratch(
            &mut self.fft.input,
            &mut self.fft.spectrum,
            &mut self.fft.scratch,
        )?;

        let range = self.max_db - self.min_db;
        let mut bins = Vec::with_capacity(self.bin_count());
        for (k, value) in self.fft.spectrum.iter().take(self.bin_count()).enumerate() {
            let magnitude = value.norm() / n as f32;
            let smoothed = self.smoothing * self.smoothed[k] + (1.0 - self.smoothing) * magnitude;
            self.smoothed[k] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = (db - self.min_db) / range * 255.0;
            bins.push(scaled.clamp(0.0, 255.0) as u8);
        }

        Ok(SpectrumSnapshot::new(bins, self.sample_rate))
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrumSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumSource")
            .field("fft_size", &self.fft_size)
            .field("sample_rate", &self.sample_rate)
            .field("smoothing", &self.smoothing)
            .field("buffered", &self.ring.len())
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
