//! Quality selection
//!
//! Coordinates:
//! - Manual bitrate overrides
//! - Operator filters (bitrate ceiling, resolution limit)
//! - Network, buffer-level and probe choosers
//! - Urgency of the resulting switch

use super::buffer_level::{BufferLevelChooser, BufferLevelInput};
use super::filters::select_optimal;
use super::network::NetworkRateAnalyzer;
use super::probe::{EstimateSource, LastEstimate, ProbeChooser};
use super::{AbrState, QualityConstraints};
use crate::config::AbrConfig;
use crate::ranges::{self, TimeRange};
use crate::types::{Estimate, MediaType, PlaybackObservation, Quality};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Produces estimates for one media type within one period
pub struct QualitySelector {
    media_type: MediaType,
    config: AbrConfig,
    state: Arc<AbrState>,
    network: NetworkRateAnalyzer,
    buffer_chooser: Option<BufferLevelChooser>,
    buffer_based_bitrate: Option<u64>,
    buffer_based_enabled: bool,
    probe: ProbeChooser,
    last_estimate: LastEstimate,
    was_manual: bool,
}

impl QualitySelector {
    pub fn new(media_type: MediaType, config: &AbrConfig, state: Arc<AbrState>) -> Self {
        Self {
            media_type,
            config: config.clone(),
            state,
            network: NetworkRateAnalyzer::new(config),
            buffer_chooser: None,
            buffer_based_bitrate: None,
            buffer_based_enabled: false,
            probe: ProbeChooser::new(),
            last_estimate: LastEstimate::default(),
            was_manual: false,
        }
    }

    pub fn last_estimate(&self) -> &LastEstimate {
        &self.last_estimate
    }

    /// Compute a new estimate.
    ///
    /// `qualities` must be sorted by ascending bitrate and only contain
    /// playable qualities.
    pub fn estimate(
        &mut self,
        qualities: &[Arc<Quality>],
        observation: &PlaybackObservation,
        current: Option<&Arc<Quality>>,
        constraints: &QualityConstraints,
        now: Instant,
    ) -> Result<Estimate> {
        if qualities.is_empty() {
            return Err(Error::NoPlayableQuality(self.media_type));
        }

        if qualities.len() == 1 {
            let estimate = Estimate {
                quality: Arc::clone(&qualities[0]),
                bitrate: None,
                urgent: true,
                manual: false,
                known_stable_bitrate: None,
            };
            self.last_estimate
                .update(&estimate.quality, None, EstimateSource::OnlyChoice);
            return Ok(estimate);
        }

        let filtered = constraints.filters.apply(qualities);

        if let Some(manual) = constraints.manual_bitrate {
            self.was_manual = true;
            let quality = select_optimal(&filtered, manual as f64, 0, None)
                .ok_or(Error::NoPlayableQuality(self.media_type))?;
            debug!(media_type = %self.media_type, manual, quality = %quality.id, "Manual quality");
            self.last_estimate.update(&quality, None, EstimateSource::Manual);
            return Ok(Estimate {
                quality,
                bitrate: None,
                urgent: true,
                manual: true,
                known_stable_bitrate: None,
            });
        }

        if self.was_manual {
            // back to auto mode: previous automatic decisions no longer apply
            self.was_manual = false;
            self.probe = ProbeChooser::new();
            self.last_estimate = LastEstimate::default();
            self.buffer_based_enabled = false;
            self.buffer_based_bitrate = None;
        }

        self.auto_estimate(&filtered, observation, current, constraints, now)
    }

    fn auto_estimate(
        &mut self,
        filtered: &[Arc<Quality>],
        observation: &PlaybackObservation,
        current: Option<&Arc<Quality>>,
        constraints: &QualityConstraints,
        now: Instant,
    ) -> Result<Estimate> {
        let requests = self.state.pending.lock().requests();
        let decision = {
            let mut throughput = self.state.throughput.lock();
            self.network.bandwidth_estimate(
                observation,
                &mut throughput,
                current.map(|q| q.as_ref()),
                &requests,
                self.last_estimate.bandwidth,
                now,
            )
        };
        let bandwidth = decision.bandwidth_estimate;

        let known_stable_bitrate = self
            .state
            .maintainability
            .lock()
            .last_stable_quality()
            .map(|q| {
                let speed = if observation.speed > 0.0 { observation.speed } else { 1.0 };
                q.bitrate as f64 / speed
            });

        let gap = observation.buffer_gap;
        if self.buffer_based_enabled && gap <= self.config.buffer_based_disable_gap {
            self.buffer_based_enabled = false;
        } else if !self.buffer_based_enabled
            && gap.is_finite()
            && gap > self.config.buffer_based_enable_gap
        {
            self.buffer_based_enabled = true;
        }

        let min = constraints.min_auto_bitrate;
        let max = constraints.max_auto_bitrate;
        let from_network = select_optimal(filtered, decision.bitrate_chosen, min, max)
            .ok_or(Error::NoPlayableQuality(self.media_type))?;
        let mut best_bitrate = from_network.bitrate;

        let mut from_buffer = None;
        if let Some(buffer_bitrate) = self.buffer_based_bitrate {
            if self.buffer_based_enabled && buffer_bitrate > best_bitrate {
                if let Some(quality) = select_optimal(filtered, buffer_bitrate as f64, min, max) {
                    best_bitrate = quality.bitrate;
                    from_buffer = Some(quality);
                }
            }
        }

        let mut from_probe = None;
        if let Some(current) = current {
            let near_live_edge = observation
                .live_gap
                .is_some_and(|live_gap| live_gap < self.config.probe_live_gap);
            if self.config.low_latency && near_live_edge {
                let tracker = self.state.maintainability.lock();
                from_probe = self
                    .probe
                    .guess(
                        filtered,
                        observation,
                        current,
                        best_bitrate,
                        &requests,
                        &self.last_estimate,
                        &tracker,
                        now,
                    )
                    .filter(|q| q.bitrate >= min && max.map_or(true, |max| q.bitrate <= max));
            }
        }

        let (quality, source) = match (from_probe, from_buffer) {
            (Some(probe), _) if probe.bitrate > best_bitrate => (probe, EstimateSource::ProbeBased),
            (_, Some(buffer)) => (buffer, EstimateSource::BufferBased),
            _ => (from_network, EstimateSource::NetworkBased),
        };

        let urgent = match source {
            EstimateSource::ProbeBased => current.map_or(true, |c| quality.bitrate < c.bitrate),
            _ => self.network.is_urgent(
                quality.bitrate,
                current.map(|q| q.as_ref()),
                &requests,
                observation,
                now,
            ),
        };

        debug!(
            media_type = %self.media_type,
            quality = %quality.id,
            bitrate = quality.bitrate,
            bandwidth = ?bandwidth,
            source = ?source,
            urgent,
            "Estimate computed"
        );
        self.last_estimate.update(&quality, bandwidth, source);

        Ok(Estimate {
            quality,
            bitrate: bandwidth,
            urgent,
            manual: false,
            known_stable_bitrate,
        })
    }

    /// Refresh the buffer-based choice after a segment of `quality` was
    /// appended, with `buffered` the ranges now in the buffer
    pub fn on_segment_appended(
        &mut self,
        qualities: &[Arc<Quality>],
        quality: &Quality,
        buffered: &[TimeRange],
        observation: &PlaybackObservation,
    ) {
        let bitrates: Vec<u64> = qualities.iter().map(|q| q.bitrate).collect();
        let stale = self
            .buffer_chooser
            .as_ref()
            .map_or(true, |chooser| chooser.bitrates() != dedup_sorted(&bitrates).as_slice());
        if stale {
            self.buffer_chooser = Some(BufferLevelChooser::new(
                &bitrates,
                self.config.buffer_level_up_score,
                self.config.buffer_level_down_score,
            ));
        }
        let Some(chooser) = self.buffer_chooser.as_ref() else {
            return;
        };
        let score = self.state.maintainability.lock().score(quality);
        let input = BufferLevelInput {
            buffer_gap: ranges::buffer_gap(buffered, observation.position),
            current_bitrate: Some(quality.bitrate),
            current_score: score.map(|s| s.score),
            speed: observation.speed,
        };
        self.buffer_based_bitrate = Some(chooser.estimate(&input));
    }
}

fn dedup_sorted(bitrates: &[u64]) -> Vec<u64> {
    let mut sorted = bitrates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}
