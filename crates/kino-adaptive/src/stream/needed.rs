//! Which segments still have to be loaded

use crate::buffer::BufferInventory;
use crate::ranges::TimeRange;
use crate::types::{Period, Quality, Segment};

/// Time range a period stream wants buffered: from the position (or the
/// period start, when preloading) up to `ahead` seconds later, never past
/// the period end
pub fn wanted_range(period: &Period, position: f64, ahead: f64) -> TimeRange {
    let start = position.max(period.start);
    let end = (position + ahead).min(period.end_or_infinity());
    TimeRange::new(start, end.max(start))
}

/// Seconds after the position within which buffered media is never replaced
/// by a better quality
pub const CONTENT_REPLACEMENT_PADDING: f64 = 1.2;

/// Media segments of `quality` overlapping `wanted` that the buffer does not
/// already hold in this quality or a better one, in time order.
///
/// Segments starting before `position + CONTENT_REPLACEMENT_PADDING` are
/// kept in whatever quality is buffered.
pub fn needed_segments(
    quality: &Quality,
    period: &Period,
    wanted: TimeRange,
    position: f64,
    inventory: &BufferInventory,
    tolerance: f64,
) -> Vec<Segment> {
    if wanted.is_empty() {
        return Vec::new();
    }
    let replaceable_from = position + CONTENT_REPLACEMENT_PADDING;
    quality
        .index
        .segments_in(wanted.start, wanted.end)
        .filter(|segment| {
            let start = segment.time.max(wanted.start).max(period.start);
            let end = segment.end().min(period.end_or_infinity());
            if end - start <= tolerance {
                return false;
            }
            let min_bitrate = if segment.time < replaceable_from {
                0
            } else {
                quality.bitrate
            };
            !inventory.covers(start, end, min_bitrate, tolerance)
        })
        .cloned()
        .collect()
}

/// Whether everything up to the end of the period has been loaded
pub fn is_period_complete(
    quality: &Quality,
    period: &Period,
    wanted: TimeRange,
    needed: &[Segment],
    tolerance: f64,
) -> bool {
    let Some(period_end) = period.end else {
        return false;
    };
    if !quality.index.finished || !needed.is_empty() {
        return false;
    }
    let content_end = quality
        .index
        .last_position()
        .map_or(period_end, |last| last.min(period_end));
    wanted.end + tolerance >= content_end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferedChunk;
    use crate::types::SegmentIndex;
    use std::sync::Arc;

    fn period() -> Period {
        Period::new("p0", 10.0, Some(30.0))
    }

    fn quality(id: &str, bitrate: u64) -> Arc<Quality> {
        Arc::new(Quality::new(
            id,
            bitrate,
            SegmentIndex::uniform(10.0, 4.0, 5, true),
        ))
    }

    #[test]
    fn test_wanted_range_is_clamped_to_period() {
        let period = period();
        assert_eq!(wanted_range(&period, 0.0, 15.0), TimeRange::new(10.0, 15.0));
        assert_eq!(wanted_range(&period, 20.0, 30.0), TimeRange::new(20.0, 30.0));
        assert!(wanted_range(&period, 35.0, 30.0).is_empty());
    }

    #[test]
    fn test_skips_segments_held_in_better_quality() {
        let period = period();
        let low = quality("low", 500_000);
        let high = quality("high", 2_000_000);
        let mut inventory = BufferInventory::new();
        inventory.insert(BufferedChunk {
            period_id: "p0".into(),
            quality: Arc::clone(&high),
            start: 10.0,
            end: 14.0,
            complete: true,
        });
        inventory.insert(BufferedChunk {
            period_id: "p0".into(),
            quality: Arc::clone(&low),
            start: 14.0,
            end: 18.0,
            complete: true,
        });

        let wanted = wanted_range(&period, 10.0, 12.0);
        let low_needed: Vec<u64> = needed_segments(&low, &period, wanted, 10.0, &inventory, 0.05)
            .iter()
            .map(|s| s.number)
            .collect();
        assert_eq!(low_needed, vec![3]);

        let high_needed: Vec<u64> = needed_segments(&high, &period, wanted, 10.0, &inventory, 0.05)
            .iter()
            .map(|s| s.number)
            .collect();
        assert_eq!(high_needed, vec![2, 3]);
    }

    #[test]
    fn test_keeps_lower_quality_under_the_position() {
        let period = period();
        let low = quality("low", 500_000);
        let high = quality("high", 2_000_000);
        let mut inventory = BufferInventory::new();
        for (start, end) in [(14.0, 18.0), (18.0, 22.0)] {
            inventory.insert(BufferedChunk {
                period_id: "p0".into(),
                quality: Arc::clone(&low),
                start,
                end,
                complete: true,
            });
        }

        let needed = |position: f64| -> Vec<u64> {
            let wanted = wanted_range(&period, position, 8.0);
            needed_segments(&high, &period, wanted, position, &inventory, 0.05)
                .iter()
                .map(|s| s.number)
                .collect()
        };
        // playing segment 2, segment 3 is far enough to be replaced
        assert_eq!(needed(15.0), vec![3, 4]);
        // segment 3 starts right after the position
        assert_eq!(needed(17.5), vec![4]);
    }

    #[test]
    fn test_completion() {
        let period = period();
        let q = quality("q", 1_000_000);
        assert!(is_period_complete(&q, &period, TimeRange::new(20.0, 30.0), &[], 0.05));
        assert!(!is_period_complete(&q, &period, TimeRange::new(10.0, 25.0), &[], 0.05));
        let open = Period::new("live", 10.0, None);
        assert!(!is_period_complete(&q, &open, TimeRange::new(20.0, 30.0), &[], 0.05));
    }
}
