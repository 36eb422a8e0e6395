//! Garbage collection planning
//!
//! Decides which buffered ranges to remove so that no more than
//! `max_behind` seconds are kept before the position and no more than
//! `max_ahead` seconds after it. The chunk currently being played is never
//! part of a removal.

use crate::ranges::{self, TimeRange};

/// Planner for one media type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GarbageCollector {
    pub max_behind: f64,
    pub max_ahead: f64,
}

impl GarbageCollector {
    pub fn new(max_behind: f64, max_ahead: f64) -> Self {
        Self {
            max_behind,
            max_ahead,
        }
    }

    /// Nothing would ever be collected
    pub fn is_disabled(&self) -> bool {
        self.max_behind.is_infinite() && self.max_ahead.is_infinite()
    }

    /// Ranges to remove from `buffered` at `position`.
    ///
    /// `playing` is the range of the chunk covering the position, if known;
    /// removals are clamped so they never cut into it.
    pub fn plan(
        &self,
        buffered: &[TimeRange],
        position: f64,
        playing: Option<TimeRange>,
    ) -> Vec<TimeRange> {
        let buffered = ranges::normalize(buffered);
        let (inner, outer) = ranges::inner_and_outer(&buffered, position);
        let mut removals = Vec::new();

        if self.max_behind.is_finite() {
            let limit = position - self.max_behind;
            for range in &outer {
                if limit >= range.end {
                    removals.push(*range);
                } else if position >= range.end && limit > range.start {
                    removals.push(TimeRange::new(range.start, limit));
                }
            }
            if let Some(inner) = inner {
                if limit > inner.start {
                    removals.push(TimeRange::new(inner.start, limit));
                }
            }
        }

        if self.max_ahead.is_finite() {
            let limit = position + self.max_ahead;
            for range in &outer {
                if limit <= range.start {
                    removals.push(*range);
                } else if position <= range.start && limit < range.end {
                    removals.push(TimeRange::new(limit, range.end));
                }
            }
            if let Some(inner) = inner {
                if limit < inner.end {
                    removals.push(TimeRange::new(limit, inner.end));
                }
            }
        }

        removals
            .into_iter()
            .map(|r| match playing {
                Some(p) => clamp_around(r, p),
                None => r,
            })
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// Shrink `removal` so it does not overlap `protected`
fn clamp_around(removal: TimeRange, protected: TimeRange) -> TimeRange {
    if !removal.overlaps(&protected) {
        return removal;
    }
    if removal.start < protected.start {
        TimeRange::new(removal.start, protected.start)
    } else {
        TimeRange::new(protected.end.max(removal.start), removal.end)
    }
}
