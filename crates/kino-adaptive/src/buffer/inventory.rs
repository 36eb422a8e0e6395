//! Record of what was pushed to a host buffer
//!
//! Chunks never overlap: pushing data over an existing chunk trims it the
//! same way the host buffer replaces the old media.

use crate::ranges::{self, TimeRange};
use crate::types::Quality;
use std::sync::Arc;

/// Media of one segment as it sits in the host buffer
#[derive(Debug, Clone)]
pub struct BufferedChunk {
    pub period_id: String,
    pub quality: Arc<Quality>,
    pub start: f64,
    pub end: f64,
    /// The whole segment was pushed
    pub complete: bool,
}

impl BufferedChunk {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Ordered, non-overlapping list of buffered chunks
#[derive(Debug, Clone, Default)]
pub struct BufferInventory {
    chunks: Vec<BufferedChunk>,
}

impl BufferInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[BufferedChunk] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Add a chunk, trimming whatever it overlaps
    pub fn insert(&mut self, chunk: BufferedChunk) {
        if chunk.end <= chunk.start {
            return;
        }
        self.remove(chunk.start, chunk.end);
        let at = self
            .chunks
            .iter()
            .position(|c| c.start >= chunk.end)
            .unwrap_or(self.chunks.len());
        self.chunks.insert(at, chunk);
    }

    /// Forget everything in `[start, end)`, splitting chunks that straddle it
    pub fn remove(&mut self, start: f64, end: f64) {
        let mut kept = Vec::with_capacity(self.chunks.len() + 1);
        for chunk in self.chunks.drain(..) {
            if chunk.end <= start || chunk.start >= end {
                kept.push(chunk);
                continue;
            }
            if chunk.start < start {
                kept.push(BufferedChunk {
                    end: start,
                    complete: false,
                    ..chunk.clone()
                });
            }
            if chunk.end > end {
                kept.push(BufferedChunk {
                    start: end,
                    complete: false,
                    ..chunk
                });
            }
        }
        self.chunks = kept;
    }

    /// Mark the chunk starting at `start` for `quality` as fully pushed
    pub fn complete(&mut self, quality_id: &str, start: f64, tolerance: f64) {
        if let Some(chunk) = self
            .chunks
            .iter_mut()
            .find(|c| c.quality.id == quality_id && (c.start - start).abs() <= tolerance)
        {
            chunk.complete = true;
        }
    }

    /// Align chunks on what the host buffer reports, dropping the ones it
    /// evicted on its own
    pub fn synchronize(&mut self, buffered: &[TimeRange], tolerance: f64) {
        let buffered = ranges::normalize(buffered);
        self.chunks.retain_mut(|chunk| {
            let overlapping: Vec<&TimeRange> = buffered
                .iter()
                .filter(|r| r.start < chunk.end - tolerance && r.end > chunk.start + tolerance)
                .collect();
            let (Some(first), Some(last)) = (overlapping.first(), overlapping.last()) else {
                return false;
            };
            if first.start > chunk.start + tolerance {
                chunk.start = first.start;
                chunk.complete = false;
            }
            if last.end < chunk.end - tolerance {
                chunk.end = last.end;
                chunk.complete = false;
            }
            true
        });
    }

    /// Chunk containing `time`
    pub fn chunk_at(&self, time: f64) -> Option<&BufferedChunk> {
        self.chunks.iter().find(|c| c.start <= time && c.end > time)
    }

    /// Whether `[start, end)` is fully covered by complete chunks of at least
    /// `min_bitrate`, allowing `tolerance` seconds of slack at each join
    pub fn covers(&self, start: f64, end: f64, min_bitrate: u64, tolerance: f64) -> bool {
        let mut cursor = start;
        for chunk in &self.chunks {
            if chunk.end <= cursor + tolerance {
                continue;
            }
            if chunk.start > cursor + tolerance {
                return false;
            }
            if !chunk.complete || chunk.quality.bitrate < min_bitrate {
                return false;
            }
            cursor = chunk.end;
            if cursor + tolerance >= end {
                return true;
            }
        }
        cursor + tolerance >= end
    }

    /// Ranges holding data of the given qualities in `period_id`, merged
    pub fn ranges_for_qualities(&self, period_id: &str, quality_ids: &[String]) -> Vec<TimeRange> {
        let ranges: Vec<TimeRange> = self
            .chunks
            .iter()
            .filter(|c| c.period_id == period_id && quality_ids.contains(&c.quality.id))
            .map(BufferedChunk::range)
            .collect();
        ranges::normalize(&ranges)
    }
}
