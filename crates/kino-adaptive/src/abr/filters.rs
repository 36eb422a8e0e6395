//! Quality list filtering and selection helpers
//!
//! All functions expect qualities sorted by ascending bitrate.

use crate::types::{Quality, Resolution};
use std::sync::Arc;

/// Highest quality whose bitrate is at most `target` clamped to
/// `[min_bitrate, max_bitrate]`, or the lowest one when none qualifies
pub fn select_optimal(
    qualities: &[Arc<Quality>],
    target: f64,
    min_bitrate: u64,
    max_bitrate: Option<u64>,
) -> Option<Arc<Quality>> {
    let max = max_bitrate.map_or(f64::INFINITY, |m| m as f64);
    let wanted = if target <= min_bitrate as f64 {
        min_bitrate as f64
    } else if target >= max {
        max
    } else {
        target
    };
    qualities
        .iter()
        .rev()
        .find(|q| q.bitrate as f64 <= wanted)
        .or_else(|| qualities.first())
        .cloned()
}

/// Keep qualities at or below `ceiling`, or only the lowest one when all of
/// them exceed it
pub fn filter_by_bitrate(qualities: &[Arc<Quality>], ceiling: u64) -> Vec<Arc<Quality>> {
    let first_above = qualities.iter().position(|q| q.bitrate > ceiling);
    match first_above {
        None => qualities.to_vec(),
        Some(index) => qualities[..index.max(1).min(qualities.len())].to_vec(),
    }
}

/// Keep qualities no larger than the smallest one covering `limit`.
/// Qualities without resolution are always kept. Nothing is filtered when no
/// quality covers the limit.
pub fn filter_by_resolution(qualities: &[Arc<Quality>], limit: Resolution) -> Vec<Arc<Quality>> {
    let smallest_covering = qualities
        .iter()
        .filter_map(|q| q.resolution)
        .filter(|r| r.covers(&limit))
        .min_by_key(|r| (r.width as u64) * (r.height as u64));

    let Some(max) = smallest_covering else {
        return qualities.to_vec();
    };
    qualities
        .iter()
        .filter(|q| q.resolution.map_or(true, |r| r.fits_in(&max)))
        .cloned()
        .collect()
}

/// Operator-imposed restrictions on the quality list
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityFilters {
    /// Maximum bitrate (e.g. a throttle from the embedding application)
    pub bitrate_ceiling: Option<u64>,
    /// Maximum useful resolution (e.g. the size of the video element)
    pub resolution_limit: Option<Resolution>,
}

impl QualityFilters {
    pub fn apply(&self, qualities: &[Arc<Quality>]) -> Vec<Arc<Quality>> {
        let mut filtered = qualities.to_vec();
        if let Some(ceiling) = self.bitrate_ceiling {
            filtered = filter_by_bitrate(&filtered, ceiling);
        }
        if let Some(limit) = self.resolution_limit {
            filtered = filter_by_resolution(&filtered, limit);
        }
        filtered
    }
}
