use serde::{Deserialize, Serialize};

use crate::{AnalysisConfig, SpectrumSnapshot};

/// Perceptual feature set handed to the renderer once per display tick.
///
/// Band energies are normalised to `[0, 1]`; `is_beat` flags a bass onset
/// for the tick the snapshot was computed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    pub is_beat: bool,
}

/// Converts a raw spectrum snapshot into normalised band energies.
///
/// The band boundaries are derived from the snapshot's sample rate rather
/// than fixed bin indices: with `bin_width = nyquist / bin_count`, the bass
/// band covers bins below 250 Hz and the mid band bins below 4 kHz (both
/// edges configurable, rounded to the nearest bin). Fixed indices would
/// misallocate frequency content whenever the sample rate differs from an
/// assumed default.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    bass_edge_hz: f32,
    mid_edge_hz: f32,
}

impl FeatureExtractor {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            bass_edge_hz: config.bass_edge_hz,
            mid_edge_hz: config.mid_edge_hz,
        }
    }

    /// Returns `(bass, mid, treble)` for the snapshot, each in `[0, 1]`.
    pub fn band_energies(&self, snapshot: &SpectrumSnapshot) -> (f32, f32, f32) {
        let bins = snapshot.bins();
        let count = bins.len();
        let (bass_end, mid_end) = self.band_edges(snapshot.sample_rate(), count);

        let bass = average(&bins[..bass_end]);
        let mid = average(&bins[bass_end..mid_end]);
        let treble = average(&bins[mid_end..]);

        (bass / 255.0, mid / 255.0, treble / 255.0)
    }

    /// Bin indices of the bass/mid band edges, clamped to `[0, bin_count]`
    /// and ordered.
    pub fn band_edges(&self, sample_rate: u32, bin_count: usize) -> (usize, usize) {
        if bin_count == 0 || sample_rate == 0 {
            return (0, 0);
        }
        let nyquist = sample_rate as f32 / 2.0;
        let bin_width = nyquist / bin_count as f32;

        let bass_end = ((self.bass_edge_hz / bin_width).round() as usize).min(bin_count);
        let mid_end = ((self.mid_edge_hz / bin_width).round() as usize)
            .min(bin_count)
            .max(bass_end);
        (bass_end, mid_end)
    }
}

/// Arithmetic mean of a byte range; an empty range averages to zero.
fn average(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u32 = bins.iter().map(|&b| b as u32).sum();
    sum as f32 / bins.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(&AnalysisConfig::default())
    }

    fn snapshot(bins: Vec<u8>, sample_rate: u32) -> SpectrumSnapshot {
        SpectrumSnapshot::new(bins, sample_rate)
    }

    #[test]
    fn all_zero_spectrum_yields_zero_bands() {
        let (bass, mid, treble) = extractor().band_energies(&snapshot(vec![0; 256], 48_000));
        assert_eq!((bass, mid, treble), (0.0, 0.0, 0.0));
    }

    #[test]
    fn bands_stay_normalised_for_a_saturated_spectrum() {
        let (bass, mid, treble) = extractor().band_energies(&snapshot(vec![255; 256], 48_000));
        for value in [bass, mid, treble] {
            assert!((0.0..=1.0).contains(&value));
            assert!((value - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn band_edges_round_to_the_nearest_bin() {
        // 48 kHz, 256 bins: bin width 93.75 Hz. 250 / 93.75 = 2.666..,
        // 4000 / 93.75 = 42.666..; both round up, not truncate.
        let (bass_end, mid_end) = extractor().band_edges(48_000, 256);
        assert_eq!(bass_end, 3);
        assert_eq!(mid_end, 43);
    }

    #[test]
    fn band_edges_scale_with_the_sample_rate() {
        let e = extractor();
        let (bass_44, mid_44) = e.band_edges(44_100, 256);
        let (bass_88, mid_88) = e.band_edges(88_200, 256);
        // Doubling the rate doubles the bin width, halving the indices
        // (up to the per-edge rounding).
        assert!((bass_88 as f32 - bass_44 as f32 / 2.0).abs() <= 0.5);
        assert!((mid_88 as f32 - mid_44 as f32 / 2.0).abs() <= 0.5);
        assert_eq!((bass_88, mid_88), (1, 23));
        assert_eq!((bass_44, mid_44), (3, 46));
    }

    #[test]
    fn boundary_exactly_between_bins_rounds_to_nearest() {
        // 51.2 kHz, 256 bins: bin width exactly 100 Hz, putting the 250 Hz
        // edge halfway between bins 2 and 3. Half-way rounds up.
        let (bass_end, mid_end) = extractor().band_edges(51_200, 256);
        assert_eq!(bass_end, 3);
        assert_eq!(mid_end, 40);
    }

    #[test]
    fn band_edges_clamp_to_the_bin_count() {
        // 8 bins at 8 kHz: bin width 500 Hz, so the 4 kHz edge lands exactly
        // on the bin count and the treble band is empty.
        let (bass_end, mid_end) = extractor().band_edges(8_000, 8);
        assert_eq!(bass_end, 1);
        assert_eq!(mid_end, 8);

        let mut bins = vec![0; 8];
        bins[0] = 200;
        let (bass, _mid, treble) = extractor().band_energies(&snapshot(bins, 8_000));
        assert!(bass > 0.0);
        // Empty treble range averages to zero rather than dividing by zero.
        assert_eq!(treble, 0.0);
    }

    #[test]
    fn energy_is_attributed_to_the_right_band() {
        let e = extractor();
        let (bass_end, mid_end) = e.band_edges(48_000, 256);

        let mut bins = vec![0u8; 256];
        for bin in bins[bass_end..mid_end].iter_mut() {
            *bin = 128;
        }
        let (bass, mid, treble) = e.band_energies(&snapshot(bins, 48_000));
        assert_eq!(bass, 0.0);
        assert!((mid - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(treble, 0.0);
    }
}
