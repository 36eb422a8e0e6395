//! Time range helpers used on buffered ranges

use serde::{Deserialize, Serialize};

/// Half-open interval `[start, end)` in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies inside this range, allowing `tolerance` seconds
    /// of slack on both sides
    pub fn covers(&self, other: &TimeRange, tolerance: f64) -> bool {
        self.start <= other.start + tolerance && self.end + tolerance >= other.end
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:.3}, {:.3})", self.start, self.end)
    }
}

/// Sort ranges and merge the ones that touch or overlap
pub fn normalize(ranges: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted: Vec<TimeRange> = ranges.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<TimeRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// Range containing `time`, if any
pub fn range_containing(ranges: &[TimeRange], time: f64) -> Option<TimeRange> {
    ranges.iter().copied().find(|r| r.contains(time))
}

/// Seconds of contiguous data from `position` to the end of the range that
/// contains it, or 0 when the position is not buffered
pub fn buffer_gap(ranges: &[TimeRange], position: f64) -> f64 {
    range_containing(ranges, position)
        .map(|r| r.end - position)
        .unwrap_or(0.0)
}

/// Splits `ranges` into the one containing `position` and all the others
pub fn inner_and_outer(ranges: &[TimeRange], position: f64) -> (Option<TimeRange>, Vec<TimeRange>) {
    let mut inner = None;
    let mut outer = Vec::with_capacity(ranges.len());
    for range in ranges {
        if inner.is_none() && range.contains(position) {
            inner = Some(*range);
        } else {
            outer.push(*range);
        }
    }
    (inner, outer)
}

/// Parts of `range` that are not covered by any of `holes`
pub fn subtract(range: TimeRange, holes: &[TimeRange]) -> Vec<TimeRange> {
    let mut remaining = vec![range];
    for hole in normalize(holes) {
        remaining = remaining
            .into_iter()
            .flat_map(|r| {
                if !r.overlaps(&hole) {
                    return vec![r];
                }
                let mut parts = Vec::with_capacity(2);
                if hole.start > r.start {
                    parts.push(TimeRange::new(r.start, hole.start));
                }
                if hole.end < r.end {
                    parts.push(TimeRange::new(hole.end, r.end));
                }
                parts
            })
            .collect();
    }
    remaining
}
