//! Buffer-occupancy based bitrate choice
//!
//! A BOLA-style heuristic: each bitrate is associated with a minimum buffer
//! level, and the chooser steps one level up or down depending on how much is
//! buffered and how maintainable the current quality has been.

use tracing::{debug, warn};

/// Inputs of [`BufferLevelChooser::estimate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferLevelInput {
    /// Seconds buffered ahead of the position
    pub buffer_gap: f64,
    /// Bitrate of the quality currently loaded, if any
    pub current_bitrate: Option<u64>,
    /// Maintainability score of that quality
    pub current_score: Option<f64>,
    /// Playback rate
    pub speed: f64,
}

/// Chooses a bitrate from buffer occupancy alone
#[derive(Debug, Clone)]
pub struct BufferLevelChooser {
    bitrates: Vec<u64>,
    levels: Vec<f64>,
    up_score: f64,
    down_score: f64,
}

impl BufferLevelChooser {
    pub fn new(bitrates: &[u64], up_score: f64, down_score: f64) -> Self {
        let mut bitrates = bitrates.to_vec();
        bitrates.sort_unstable();
        bitrates.dedup();
        let levels = buffer_levels(&bitrates);
        debug!(?bitrates, ?levels, "Buffer levels computed");
        Self {
            bitrates,
            levels,
            up_score,
            down_score,
        }
    }

    /// Minimum buffer level for each bitrate, in ascending bitrate order
    pub fn levels(&self) -> &[f64] {
        &self.levels
    }

    pub fn bitrates(&self) -> &[u64] {
        &self.bitrates
    }

    /// Bitrate to load next
    pub fn estimate(&self, input: &BufferLevelInput) -> u64 {
        let lowest = self.bitrates.first().copied().unwrap_or(0);
        let Some(current_bitrate) = input.current_bitrate else {
            return lowest;
        };
        let Some(index) = self.bitrates.iter().position(|&b| b == current_bitrate) else {
            warn!(current_bitrate, "Current bitrate not found in the buffer levels");
            return lowest;
        };

        let scaled_score = input.current_score.map(|score| {
            if input.speed == 0.0 {
                score
            } else {
                score / input.speed
            }
        });

        if scaled_score.is_some_and(|s| s > self.up_score) {
            let current_level = self.levels[index];
            let next = (index + 1..self.levels.len()).find(|&i| self.levels[i] > current_level);
            if let Some(next) = next {
                if input.buffer_gap >= self.levels[next] {
                    return self.bitrates[next];
                }
            }
        }

        if scaled_score.map_or(true, |s| s < self.down_score)
            && input.buffer_gap < self.levels[index]
        {
            if let Some(&lower) = self.bitrates[..index].iter().rev().find(|&&b| b < current_bitrate) {
                return lower;
            }
        }

        current_bitrate
    }
}

/// Minimum buffer levels for strictly increasing `bitrates`
pub fn buffer_levels(bitrates: &[u64]) -> Vec<f64> {
    let Some(&first) = bitrates.first() else {
        return Vec::new();
    };
    let first = first.max(1) as f64;
    let utilities: Vec<f64> = bitrates
        .iter()
        .map(|&b| (b.max(1) as f64 / first).ln() + 1.0)
        .collect();
    let n = bitrates.len();
    let gp = (utilities[n - 1] - 1.0) / (n as f64 * 2.0 + 10.0);
    let vp = 1.0 / gp;

    (0..n)
        .map(|i| {
            if i == 0 {
                return 0.0;
            }
            let b = bitrates[i] as f64;
            let prev = bitrates[i - 1] as f64;
            let term = (b * utilities[i - 1] - prev * utilities[i]) / (b - prev);
            vp * (gp + term) + 4.0
        })
        .collect()
}
