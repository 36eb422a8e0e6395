//! Maintainability scores
//!
//! For every quality, how fast its segments were downloaded compared to how
//! long they play: a score above 1 means the quality was loaded faster than
//! real time.

use super::throughput::Ewma;
use crate::types::Quality;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How much history backs a score
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreConfidence {
    Low,
    High,
}

/// Score of one quality
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaintainabilityScore {
    pub score: f64,
    pub confidence: ScoreConfidence,
}

#[derive(Debug, Clone)]
struct QualityHistory {
    ewma: Ewma,
    loaded_segments: u32,
    loaded_duration: f64,
}

/// Per-quality score bookkeeping shared by every stream of a media type
#[derive(Debug, Default)]
pub struct MaintainabilityTracker {
    histories: HashMap<String, QualityHistory>,
    last_stable: Option<Arc<Quality>>,
}

impl MaintainabilityTracker {
    const HALF_LIFE: f64 = 5.0;
    const HIGH_CONFIDENCE_SEGMENTS: u32 = 5;
    const HIGH_CONFIDENCE_DURATION: f64 = 10.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a segment of `segment_duration` seconds of `quality` took
    /// `request_duration` to download
    pub fn add_sample(&mut self, quality: &Arc<Quality>, request_duration: Duration, segment_duration: f64) {
        let request_secs = request_duration.as_secs_f64();
        if request_secs <= 0.0 || segment_duration <= 0.0 {
            return;
        }
        let ratio = segment_duration / request_secs;
        let history = self
            .histories
            .entry(quality.id.clone())
            .or_insert_with(|| QualityHistory {
                ewma: Ewma::new(Self::HALF_LIFE),
                loaded_segments: 0,
                loaded_duration: 0.0,
            });
        history.ewma.add_sample(request_secs, ratio);
        history.loaded_segments += 1;
        history.loaded_duration += segment_duration;

        let score = history.ewma.estimate();
        let already_stable = self
            .last_stable
            .as_ref()
            .is_some_and(|q| Arc::ptr_eq(q, quality));
        if score > 1.0 && !already_stable {
            debug!(quality = %quality.id, bitrate = quality.bitrate, score, "New last stable quality");
            self.last_stable = Some(Arc::clone(quality));
        }
    }

    /// Score of `quality`, if it was ever loaded
    pub fn score(&self, quality: &Quality) -> Option<MaintainabilityScore> {
        let history = self.histories.get(&quality.id)?;
        let confidence = if history.loaded_segments >= Self::HIGH_CONFIDENCE_SEGMENTS
            && history.loaded_duration >= Self::HIGH_CONFIDENCE_DURATION
        {
            ScoreConfidence::High
        } else {
            ScoreConfidence::Low
        };
        Some(MaintainabilityScore {
            score: history.ewma.estimate(),
            confidence,
        })
    }

    /// Last quality whose score went above 1
    pub fn last_stable_quality(&self) -> Option<Arc<Quality>> {
        self.last_stable.clone()
    }
}
