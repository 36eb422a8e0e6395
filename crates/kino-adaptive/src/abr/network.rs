//! Bitrate ceiling from network conditions
//!
//! Turns the throughput estimate into the maximum bitrate a quality should
//! have, switching to a more conservative "starvation mode" when the buffer
//! runs low and doing emergency estimates from the request that playback is
//! currently waiting for.

use super::pending::{PendingRequest, RequestProgress};
use super::throughput::ThroughputEstimator;
use crate::config::AbrConfig;
use crate::types::{PlaybackObservation, Quality};
use tokio::time::Instant;
use tracing::info;

/// Output of [`NetworkRateAnalyzer::bandwidth_estimate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthDecision {
    /// Raw bandwidth estimate, if one is available
    pub bandwidth_estimate: Option<f64>,
    /// Maximum bitrate the chosen quality should have
    pub bitrate_chosen: f64,
}

/// Network-based bitrate analysis for one media type
#[derive(Debug, Clone)]
pub struct NetworkRateAnalyzer {
    config: AbrConfig,
    in_starvation: bool,
}

impl NetworkRateAnalyzer {
    pub fn new(config: &AbrConfig) -> Self {
        Self {
            config: config.clone(),
            in_starvation: false,
        }
    }

    pub fn in_starvation_mode(&self) -> bool {
        self.in_starvation
    }

    /// Compute the bandwidth estimate and the bitrate ceiling for the next
    /// quality choice
    pub fn bandwidth_estimate(
        &mut self,
        observation: &PlaybackObservation,
        estimator: &mut ThroughputEstimator,
        current: Option<&Quality>,
        requests: &[PendingRequest],
        last_estimated_bitrate: Option<f64>,
        now: Instant,
    ) -> BandwidthDecision {
        self.update_starvation_mode(observation);

        let mut bitrate_ceiling = None;
        let mut bandwidth_estimate = None;

        if self.in_starvation {
            if let Some(emergency) = starvation_mode_bitrate(
                requests,
                observation,
                current,
                last_estimated_bitrate,
                now,
            ) {
                info!(bitrate = emergency, "Starvation mode emergency estimate");
                estimator.reset();
                bandwidth_estimate = Some(emergency);
                bitrate_ceiling = Some(match current {
                    Some(q) => emergency.min(q.bitrate as f64),
                    None => emergency,
                });
            }
        }

        let mut bitrate_chosen = match bitrate_ceiling {
            Some(ceiling) => ceiling,
            None => {
                let factor = if self.in_starvation {
                    self.config.starvation_bitrate_factor
                } else {
                    self.config.regular_bitrate_factor()
                };
                bandwidth_estimate = estimator.estimate();
                match (bandwidth_estimate, last_estimated_bitrate) {
                    (Some(estimate), _) => estimate * factor,
                    (None, Some(last)) => last * factor,
                    (None, None) => self.config.initial_bitrate,
                }
            }
        };

        if observation.speed > 1.0 {
            bitrate_chosen /= observation.speed;
        }

        BandwidthDecision {
            bandwidth_estimate,
            bitrate_chosen,
        }
    }

    /// Whether switching to `bitrate` should happen right away
    pub fn is_urgent(
        &self,
        bitrate: u64,
        current: Option<&Quality>,
        requests: &[PendingRequest],
        observation: &PlaybackObservation,
        now: Instant,
    ) -> bool {
        match current {
            None => true,
            Some(q) if bitrate == q.bitrate => false,
            Some(q) if bitrate > q.bitrate => !self.in_starvation,
            Some(_) => should_directly_switch_to_low_bitrate(
                observation,
                requests,
                self.config.starvation_gap(),
                now,
            ),
        }
    }

    fn update_starvation_mode(&mut self, observation: &PlaybackObservation) {
        let PlaybackObservation {
            buffer_gap,
            position,
            duration,
            ..
        } = *observation;

        let reaches_end = duration.is_some_and(|d| {
            buffer_gap + position >= d - self.config.starvation_duration_delta
        });
        if reaches_end {
            if self.in_starvation {
                info!("Leaving starvation mode, content end is buffered");
                self.in_starvation = false;
            }
            return;
        }

        if !self.in_starvation && buffer_gap <= self.config.starvation_gap() {
            info!(buffer_gap, "Entering starvation mode");
            self.in_starvation = true;
        } else if self.in_starvation && buffer_gap >= self.config.out_of_starvation_gap() {
            info!(buffer_gap, "Leaving starvation mode");
            self.in_starvation = false;
        }
    }
}

/// Request loading the segment playback will need next
fn concerned_request(requests: &[PendingRequest], needed_position: f64) -> Option<&PendingRequest> {
    requests.iter().find(|r| {
        r.segment.duration > 0.0
            && r.segment.end() > needed_position
            && needed_position - r.segment.time > -0.3
    })
}

/// Seconds still needed to finish a request at `bandwidth` bits per second
fn remaining_time(last: &RequestProgress, bandwidth: f64) -> f64 {
    let remaining_bits = last
        .total_size
        .map(|total| total.saturating_sub(last.size) as f64 * 8.0)
        .unwrap_or(0.0);
    (remaining_bits / bandwidth).max(0.0)
}

fn starvation_mode_bitrate(
    requests: &[PendingRequest],
    observation: &PlaybackObservation,
    current: Option<&Quality>,
    last_estimated_bitrate: Option<f64>,
    now: Instant,
) -> Option<f64> {
    let needed_position = observation.position + observation.buffer_gap;
    let request = concerned_request(requests, needed_position)?;
    let speed = if observation.speed > 0.0 { observation.speed } else { 1.0 };

    if let (Some(last), Some(bandwidth)) = (request.last_progress(), request.estimate_bandwidth()) {
        let remaining = remaining_time(last, bandwidth) * 1.2;
        let since_last = now.saturating_duration_since(last.timestamp).as_secs_f64();
        if since_last <= remaining && remaining > observation.buffer_gap / speed {
            return Some(bandwidth);
        }
    }

    let elapsed = now.saturating_duration_since(request.started_at).as_secs_f64();
    let chunk_duration = request.segment.duration;
    let reasonable = elapsed <= (chunk_duration * 1.5 + 1.0) / speed;
    let current = current?;
    if reasonable {
        return None;
    }
    let factor = chunk_duration / elapsed;
    let reduced = current.bitrate as f64 * factor.min(0.7);
    match last_estimated_bitrate {
        Some(last) if reduced >= last => None,
        _ => Some(reduced),
    }
}

fn should_directly_switch_to_low_bitrate(
    observation: &PlaybackObservation,
    requests: &[PendingRequest],
    starvation_gap: f64,
    now: Instant,
) -> bool {
    let needed_position = observation.position + observation.buffer_gap;
    let Some(request) = requests.iter().find(|r| r.segment.end() > needed_position) else {
        return true;
    };
    let (Some(last), Some(bandwidth)) = (request.last_progress(), request.estimate_bandwidth()) else {
        return true;
    };
    let speed = if observation.speed > 0.0 { observation.speed } else { 1.0 };
    let remaining = remaining_time(last, bandwidth);
    let since_last = now.saturating_duration_since(last.timestamp).as_secs_f64();
    !(since_last <= remaining * 1.2 && remaining < observation.buffer_gap / speed + starvation_gap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Segment, SegmentIndex};
    use std::sync::Arc;
    use std::time::Duration;

    fn quality(bitrate: u64) -> Quality {
        Quality::new(format!("q{bitrate}"), bitrate, SegmentIndex::default())
    }

    fn trained_estimator() -> ThroughputEstimator {
        let mut estimator = ThroughputEstimator::new(&AbrConfig::default());
        for _ in 0..20 {
            // 4 Mbps
            estimator.add_sample(Duration::from_secs(1), 500_000, false);
        }
        estimator
    }

    #[test]
    fn test_regular_factor() {
        let mut analyzer = NetworkRateAnalyzer::new(&AbrConfig::default());
        let mut estimator = trained_estimator();
        let observation = PlaybackObservation::at(0.0).with_buffer_gap(20.0);
        let decision =
            analyzer.bandwidth_estimate(&observation, &mut estimator, None, &[], None, Instant::now());
        assert!(!analyzer.in_starvation_mode());
        assert!((decision.bitrate_chosen - 3_200_000.0).abs() < 1.0);
    }

    #[test]
    fn test_starvation_hysteresis() {
        let mut analyzer = NetworkRateAnalyzer::new(&AbrConfig::default());
        let mut estimator = trained_estimator();
        let now = Instant::now();
        let starving = PlaybackObservation::at(0.0).with_buffer_gap(2.0);
        let decision = analyzer.bandwidth_estimate(&starving, &mut estimator, None, &[], None, now);
        assert!(analyzer.in_starvation_mode());
        assert!((decision.bitrate_chosen - 2_880_000.0).abs() < 1.0);

        let recovering = PlaybackObservation::at(0.0).with_buffer_gap(6.0);
        analyzer.bandwidth_estimate(&recovering, &mut estimator, None, &[], None, now);
        assert!(analyzer.in_starvation_mode());

        let recovered = PlaybackObservation::at(0.0).with_buffer_gap(7.0);
        analyzer.bandwidth_estimate(&recovered, &mut estimator, None, &[], None, now);
        assert!(!analyzer.in_starvation_mode());
    }

    #[test]
    fn test_no_starvation_near_content_end() {
        let mut analyzer = NetworkRateAnalyzer::new(&AbrConfig::default());
        let mut estimator = trained_estimator();
        let mut observation = PlaybackObservation::at(98.0).with_buffer_gap(2.0);
        observation.duration = Some(100.0);
        analyzer.bandwidth_estimate(&observation, &mut estimator, None, &[], None, Instant::now());
        assert!(!analyzer.in_starvation_mode());
    }

    #[test]
    fn test_initial_bitrate_and_speed() {
        let config = AbrConfig {
            initial_bitrate: 1_000_000.0,
            ..Default::default()
        };
        let mut analyzer = NetworkRateAnalyzer::new(&config);
        let mut estimator = ThroughputEstimator::new(&config);
        let observation = PlaybackObservation::at(0.0).with_buffer_gap(20.0).with_speed(2.0);
        let decision =
            analyzer.bandwidth_estimate(&observation, &mut estimator, None, &[], None, Instant::now());
        assert_eq!(decision.bandwidth_estimate, None);
        assert_eq!(decision.bitrate_chosen, 500_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_request_reduces_bitrate() {
        let mut analyzer = NetworkRateAnalyzer::new(&AbrConfig::default());
        let mut estimator = trained_estimator();
        let current = Arc::new(quality(4_000_000));
        let request = PendingRequest {
            id: 1,
            quality: Arc::clone(&current),
            segment: Segment::media(3, 10.0, 2.0),
            started_at: Instant::now(),
            progress: Vec::new(),
        };
        tokio::time::advance(Duration::from_secs(8)).await;

        let observation = PlaybackObservation::at(9.0).with_buffer_gap(1.0);
        let decision = analyzer.bandwidth_estimate(
            &observation,
            &mut estimator,
            Some(current.as_ref()),
            &[request],
            None,
            Instant::now(),
        );
        // 2s segment still loading after 8s: 4 Mbps * 0.25
        assert!((decision.bitrate_chosen - 1_000_000.0).abs() < 1.0);
        assert_eq!(estimator.estimate(), None);
    }

    #[test]
    fn test_urgency() {
        let analyzer = NetworkRateAnalyzer::new(&AbrConfig::default());
        let current = quality(2_000_000);
        let observation = PlaybackObservation::at(0.0).with_buffer_gap(20.0);
        let now = Instant::now();
        assert!(analyzer.is_urgent(1_000_000, None, &[], &observation, now));
        assert!(!analyzer.is_urgent(2_000_000, Some(&current), &[], &observation, now));
        assert!(analyzer.is_urgent(4_000_000, Some(&current), &[], &observation, now));
        // going down with no request to wait for
        assert!(analyzer.is_urgent(1_000_000, Some(&current), &[], &observation, now));
    }
}
