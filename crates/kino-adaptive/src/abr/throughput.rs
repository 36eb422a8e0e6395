//! Network throughput estimation
//!
//! Two exponentially weighted moving averages with different half-lives are
//! fed with every completed request. The lower of the two is used so that the
//! estimate adapts down quickly but up slowly.

use crate::config::AbrConfig;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Exponentially weighted moving average whose samples are weighted by a
/// duration in seconds
#[derive(Clone, Debug)]
pub(crate) struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    pub(crate) fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    pub(crate) fn add_sample(&mut self, weight: f64, value: f64) {
        let weight = weight.max(0.0);
        let adj_alpha = self.alpha.powf(weight);
        self.last_estimate = value * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight;
    }

    pub(crate) fn estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
        self.last_estimate / zero_factor
    }
}

/// Bandwidth estimator shared by every stream of a media type
#[derive(Clone, Debug)]
pub struct ThroughputEstimator {
    fast_ewma: Ewma,
    slow_ewma: Ewma,
    bytes_sampled: u64,
    fast_half_life: f64,
    slow_half_life: f64,
    min_total_bytes: u64,
    min_chunk_bytes: u64,
    low_latency: bool,
    low_latency_rates: VecDeque<f64>,
}

impl ThroughputEstimator {
    const LOW_LATENCY_WINDOW: usize = 3;

    pub fn new(config: &AbrConfig) -> Self {
        Self {
            fast_ewma: Ewma::new(config.fast_half_life),
            slow_ewma: Ewma::new(config.slow_half_life),
            bytes_sampled: 0,
            fast_half_life: config.fast_half_life,
            slow_half_life: config.slow_half_life,
            min_total_bytes: config.min_total_bytes,
            min_chunk_bytes: config.min_chunk_bytes,
            low_latency: config.low_latency,
            low_latency_rates: VecDeque::with_capacity(Self::LOW_LATENCY_WINDOW),
        }
    }

    /// Record a completed request of `bytes` bytes that took `duration`.
    ///
    /// `is_chunk` marks partial-segment samples received in low-latency mode,
    /// whose throughput is often limited by the encoder rather than the
    /// network.
    pub fn add_sample(&mut self, duration: Duration, bytes: u64, is_chunk: bool) {
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let rate = bytes as f64 * 8.0 / secs;
        if is_chunk && self.low_latency && !self.should_consider_low_latency_sample(rate) {
            return;
        }
        if bytes < self.min_chunk_bytes {
            return;
        }
        self.bytes_sampled += bytes;
        self.fast_ewma.add_sample(secs, rate);
        self.slow_ewma.add_sample(secs, rate);
        debug!(rate, bytes, duration_ms = secs * 1000.0, "Throughput sample");
    }

    /// Bandwidth estimate in bits per second, once enough data was sampled
    pub fn estimate(&self) -> Option<f64> {
        if self.bytes_sampled < self.min_total_bytes {
            return None;
        }
        Some(self.fast_ewma.estimate().min(self.slow_ewma.estimate()))
    }

    /// Forget every sample
    pub fn reset(&mut self) {
        self.fast_ewma = Ewma::new(self.fast_half_life);
        self.slow_ewma = Ewma::new(self.slow_half_life);
        self.low_latency_rates.clear();
        self.bytes_sampled = 0;
    }

    fn should_consider_low_latency_sample(&mut self, rate: f64) -> bool {
        if self.low_latency_rates.len() >= Self::LOW_LATENCY_WINDOW {
            let mean =
                self.low_latency_rates.iter().sum::<f64>() / self.low_latency_rates.len() as f64;
            if rate > mean * 0.8 && rate <= mean {
                return false;
            }
        }
        self.low_latency_rates.push_back(rate);
        if self.low_latency_rates.len() > Self::LOW_LATENCY_WINDOW {
            self.low_latency_rates.pop_front();
        }
        true
    }
}
