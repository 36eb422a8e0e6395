//! Optimistic quality probing for low-latency contents
//!
//! Near the live edge the buffer is too small for the buffer-based chooser to
//! ever step up, and chunked transfers make throughput samples unreliable.
//! This chooser instead tries the next quality up whenever the current one is
//! comfortably maintainable, and backs off (with an increasing blocking
//! period) when a guess turns out to be wrong.

use super::maintainability::{MaintainabilityScore, MaintainabilityTracker, ScoreConfidence};
use super::pending::PendingRequest;
use crate::types::{PlaybackObservation, Quality};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Which chooser produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateSource {
    BufferBased,
    NetworkBased,
    ProbeBased,
    Manual,
    OnlyChoice,
}

/// Last estimate produced by the selector
#[derive(Debug, Clone, Default)]
pub struct LastEstimate {
    pub quality: Option<Arc<Quality>>,
    pub bandwidth: Option<f64>,
    pub source: Option<EstimateSource>,
}

impl LastEstimate {
    pub fn update(&mut self, quality: &Arc<Quality>, bandwidth: Option<f64>, source: EstimateSource) {
        self.quality = Some(Arc::clone(quality));
        self.bandwidth = bandwidth;
        self.source = Some(source);
    }
}

/// Guess-based chooser state
#[derive(Debug, Default)]
pub struct ProbeChooser {
    consecutive_wrong_guesses: u32,
    block_guesses_until: Option<Instant>,
    last_maintainable_bitrate: Option<u64>,
}

impl ProbeChooser {
    const MIN_BUFFER_GAP: f64 = 2.5;
    const GUESS_SCORE: f64 = 1.01;
    const VALIDATION_SCORE: f64 = 1.5;
    const BLOCK_STEP: Duration = Duration::from_secs(15);
    const MAX_BLOCK: Duration = Duration::from_secs(120);

    pub fn new() -> Self {
        Self::default()
    }

    /// Quality to probe, if any
    #[allow(clippy::too_many_arguments)]
    pub fn guess(
        &mut self,
        qualities: &[Arc<Quality>],
        observation: &PlaybackObservation,
        current: &Arc<Quality>,
        incoming_best_bitrate: u64,
        requests: &[PendingRequest],
        last: &LastEstimate,
        tracker: &MaintainabilityTracker,
        now: Instant,
    ) -> Option<Arc<Quality>> {
        let last_chosen = last.quality.as_ref()?;
        let guessing = last.source == Some(EstimateSource::ProbeBased);

        if incoming_best_bitrate > last_chosen.bitrate {
            // other choosers already caught up with the guess
            if guessing {
                self.last_maintainable_bitrate = Some(last_chosen.bitrate);
                self.consecutive_wrong_guesses = 0;
            }
            return None;
        }

        let score = tracker.score(current);
        if !guessing {
            let score = score?;
            if self.can_guess_higher(observation, &score, now) {
                return next_quality(qualities, current);
            }
            return None;
        }

        if self.is_guess_validated(last_chosen, incoming_best_bitrate, score.as_ref()) {
            debug!(bitrate = last_chosen.bitrate, "Guessed quality validated");
            self.last_maintainable_bitrate = Some(last_chosen.bitrate);
            self.consecutive_wrong_guesses = 0;
        }

        if current.id != last_chosen.id {
            return Some(Arc::clone(last_chosen));
        }

        if self.should_stop_guess(current, score.as_ref(), observation.buffer_gap, requests, now) {
            self.consecutive_wrong_guesses += 1;
            let block = (Self::BLOCK_STEP * self.consecutive_wrong_guesses).min(Self::MAX_BLOCK);
            self.block_guesses_until = Some(now + block);
            debug!(
                bitrate = current.bitrate,
                wrong_guesses = self.consecutive_wrong_guesses,
                block_secs = block.as_secs(),
                "Abandoning guessed quality"
            );
            return previous_quality(qualities, current);
        }

        let Some(score) = score else {
            return Some(Arc::clone(current));
        };
        if self.can_guess_higher(observation, &score, now) {
            if let Some(next) = next_quality(qualities, current) {
                return Some(next);
            }
        }
        Some(Arc::clone(current))
    }

    fn can_guess_higher(
        &self,
        observation: &PlaybackObservation,
        score: &MaintainabilityScore,
        now: Instant,
    ) -> bool {
        let speed = if observation.speed > 0.0 { observation.speed } else { 1.0 };
        observation.buffer_gap.is_finite()
            && observation.buffer_gap >= Self::MIN_BUFFER_GAP
            && !self.is_blocked(now)
            && score.confidence == ScoreConfidence::High
            && score.score / speed > Self::GUESS_SCORE
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.block_guesses_until.is_some_and(|until| now <= until)
    }

    fn should_stop_guess(
        &self,
        guess: &Quality,
        score: Option<&MaintainabilityScore>,
        buffer_gap: f64,
        requests: &[PendingRequest],
        now: Instant,
    ) -> bool {
        if score.is_some_and(|s| s.score < Self::GUESS_SCORE) {
            return true;
        }
        if score.map_or(true, |s| s.score < 1.2) && buffer_gap < 0.6 {
            return true;
        }

        requests
            .iter()
            .filter(|r| r.quality.id == guess.id)
            .any(|r| {
                let elapsed = now.saturating_duration_since(r.started_at);
                if r.segment.is_init {
                    elapsed > Duration::from_secs(1)
                } else if elapsed.as_secs_f64() > r.segment.duration + 0.2 {
                    true
                } else {
                    r.estimate_bandwidth()
                        .is_some_and(|bw| bw < guess.bitrate as f64 * 0.8)
                }
            })
    }

    fn is_guess_validated(
        &self,
        guess: &Quality,
        incoming_best_bitrate: u64,
        score: Option<&MaintainabilityScore>,
    ) -> bool {
        if score.is_some_and(|s| {
            s.confidence == ScoreConfidence::High && s.score > Self::VALIDATION_SCORE
        }) {
            return true;
        }
        incoming_best_bitrate >= guess.bitrate
            && self
                .last_maintainable_bitrate
                .map_or(true, |b| b < guess.bitrate)
    }
}

fn next_quality(qualities: &[Arc<Quality>], current: &Quality) -> Option<Arc<Quality>> {
    let index = qualities.iter().position(|q| q.id == current.id)?;
    qualities[index + 1..]
        .iter()
        .find(|q| q.bitrate > current.bitrate)
        .cloned()
}

fn previous_quality(qualities: &[Arc<Quality>], current: &Quality) -> Option<Arc<Quality>> {
    let index = qualities.iter().position(|q| q.id == current.id)?;
    qualities[..index]
        .iter()
        .rev()
        .find(|q| q.bitrate < current.bitrate)
        .cloned()
}
