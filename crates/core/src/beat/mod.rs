use std::collections::VecDeque;

use crate::AnalysisConfig;

/// Online beat-onset detector over the bass-energy time series.
///
/// Keeps a bounded FIFO of recent bass energies and flags an onset whenever
/// the current value stands out against the local average while also
/// clearing an absolute floor. The relative check alone would fire on noise
/// during uniformly loud passages; the floor suppresses onsets whose spike
/// is only relative to near-silence. Constant time per tick.
#[derive(Debug, Clone)]
pub struct BeatDetector {
    history: VecDeque<f32>,
    local_average: f32,
    window: usize,
    ratio: f32,
    floor: f32,
}

impl BeatDetector {
    pub fn new(config: &AnalysisConfig) -> Self {
        let window = config.beat_history.max(1);
        Self {
            history: VecDeque::with_capacity(window),
            local_average: 0.0,
            window,
            ratio: config.beat_ratio,
            floor: config.beat_floor,
        }
    }

    /// Feeds one bass-energy sample and reports whether it is an onset.
    pub fn on_bass(&mut self, bass: f32) -> bool {
        self.history.push_back(bass);
        if self.history.len() > self.window {
            self.history.pop_front();
        }

        let sum: f32 = self.history.iter().sum();
        self.local_average = sum / self.history.len() as f32;

        bass > self.local_average * self.ratio && bass > self.floor
    }

    /// Clears the rolling history. Called whenever a new source connects so
    /// one track's energy profile never colours the next one's onsets.
    pub fn reset(&mut self) {
        self.history.clear();
        self.local_average = 0.0;
    }

    /// Arithmetic mean of the current history.
    pub fn local_average(&self) -> f32 {
        self.local_average
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
