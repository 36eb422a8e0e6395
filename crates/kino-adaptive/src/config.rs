//! Tunables for the decision engine
//!
//! Every numeric constant the estimators, scheduler and orchestrator rely on
//! lives here so that it can be loaded from a JSON file and overridden per
//! deployment.

use crate::{types::MediaType, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard cap applied to text and image buffers (5 hours)
pub const LIGHTWEIGHT_BUFFER_CAP: f64 = 5.0 * 3600.0;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Bitrate estimation settings
    pub abr: AbrConfig,
    /// Segment request settings
    pub request: RequestConfig,
    /// Buffer sizing settings
    pub buffer: BufferConfig,
}

impl AdaptiveConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Reject combinations the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.abr.fast_half_life <= 0.0 || self.abr.slow_half_life <= 0.0 {
            return Err(Error::InvalidConfig(
                "EWMA half-lives must be positive".into(),
            ));
        }
        if self.abr.buffer_based_disable_gap > self.abr.buffer_based_enable_gap {
            return Err(Error::InvalidConfig(
                "buffer-based disable gap must not exceed the enable gap".into(),
            ));
        }
        if self.request.high_priority_threshold >= self.request.cancellable_priority_threshold {
            return Err(Error::InvalidConfig(
                "high priority threshold must be below the cancellable threshold".into(),
            ));
        }
        if self.request.priority_steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidConfig(
                "priority steps must be strictly increasing".into(),
            ));
        }
        if self.buffer.wanted_buffer_ahead <= 0.0 {
            return Err(Error::InvalidConfig(
                "wanted buffer ahead must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters of the bitrate estimators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Half-life of the fast throughput EWMA (seconds)
    pub fast_half_life: f64,
    /// Half-life of the slow throughput EWMA (seconds)
    pub slow_half_life: f64,
    /// Bytes that must have been sampled before an estimate is produced
    pub min_total_bytes: u64,
    /// Samples smaller than this are ignored
    pub min_chunk_bytes: u64,
    /// Buffer gap at or below which starvation mode is entered
    pub starvation_gap: f64,
    /// Same for low-latency contents
    pub starvation_gap_low_latency: f64,
    /// Buffer gap at or above which starvation mode is left
    pub out_of_starvation_gap: f64,
    /// Same for low-latency contents
    pub out_of_starvation_gap_low_latency: f64,
    /// Factor applied to the estimate while starving
    pub starvation_bitrate_factor: f64,
    /// Factor applied to the estimate otherwise
    pub regular_bitrate_factor: f64,
    /// Same for low-latency contents
    pub regular_bitrate_factor_low_latency: f64,
    /// Starvation mode is not entered when the buffer reaches the content
    /// end within this delta
    pub starvation_duration_delta: f64,
    /// Buffer gap above which the buffer-based chooser is consulted
    pub buffer_based_enable_gap: f64,
    /// Buffer gap at or below which it stops being consulted
    pub buffer_based_disable_gap: f64,
    /// Minimum speed-adjusted score to step up one level
    pub buffer_level_up_score: f64,
    /// Below this speed-adjusted score the chooser may step down
    pub buffer_level_down_score: f64,
    /// Distance to the live edge under which probing is allowed
    pub probe_live_gap: f64,
    /// Bitrate used before any estimate exists
    pub initial_bitrate: f64,
    /// Content is played in low-latency mode
    pub low_latency: bool,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            fast_half_life: 2.0,
            slow_half_life: 10.0,
            min_total_bytes: 150_000,
            min_chunk_bytes: 16_000,
            starvation_gap: 5.0,
            starvation_gap_low_latency: 5.0,
            out_of_starvation_gap: 7.0,
            out_of_starvation_gap_low_latency: 7.0,
            starvation_bitrate_factor: 0.72,
            regular_bitrate_factor: 0.8,
            regular_bitrate_factor_low_latency: 0.8,
            starvation_duration_delta: 0.1,
            buffer_based_enable_gap: 10.0,
            buffer_based_disable_gap: 5.0,
            buffer_level_up_score: 1.0,
            buffer_level_down_score: 1.15,
            probe_live_gap: 40.0,
            initial_bitrate: 0.0,
            low_latency: false,
        }
    }
}

impl AbrConfig {
    pub(crate) fn starvation_gap(&self) -> f64 {
        if self.low_latency {
            self.starvation_gap_low_latency
        } else {
            self.starvation_gap
        }
    }

    pub(crate) fn out_of_starvation_gap(&self) -> f64 {
        if self.low_latency {
            self.out_of_starvation_gap_low_latency
        } else {
            self.out_of_starvation_gap
        }
    }

    pub(crate) fn regular_bitrate_factor(&self) -> f64 {
        if self.low_latency {
            self.regular_bitrate_factor_low_latency
        } else {
            self.regular_bitrate_factor
        }
    }
}

/// Retry and prioritization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Retries for regular failures
    pub max_retry_regular: u32,
    /// Retries for failures caused by the lack of connectivity
    pub max_retry_offline: u32,
    /// Initial backoff delay (ms)
    pub base_delay_ms: u64,
    /// Backoff ceiling (ms)
    pub max_delay_ms: u64,
    /// Initial backoff delay in low-latency mode (ms)
    pub base_delay_low_latency_ms: u64,
    /// Backoff ceiling in low-latency mode (ms)
    pub max_delay_low_latency_ms: u64,
    /// Relative random spread applied to every delay
    pub fuzz_factor: f64,
    /// Distances (seconds) separating consecutive segment priorities
    pub priority_steps: Vec<f64>,
    /// Tasks at or below this priority preempt cancellable ones
    pub high_priority_threshold: i32,
    /// Tasks at or above this priority can be preempted
    pub cancellable_priority_threshold: i32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_retry_regular: 4,
            max_retry_offline: u32::MAX,
            base_delay_ms: 200,
            max_delay_ms: 3000,
            base_delay_low_latency_ms: 50,
            max_delay_low_latency_ms: 1000,
            fuzz_factor: 0.3,
            priority_steps: vec![2.0, 4.0, 8.0, 12.0, 18.0, 25.0],
            high_priority_threshold: 1,
            cancellable_priority_threshold: 3,
        }
    }
}

impl RequestConfig {
    /// Base and maximum backoff delays for the given mode
    pub fn backoff_delays(&self, low_latency: bool) -> (Duration, Duration) {
        if low_latency {
            (
                Duration::from_millis(self.base_delay_low_latency_ms),
                Duration::from_millis(self.max_delay_low_latency_ms),
            )
        } else {
            (
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
        }
    }
}

/// Buffer sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Seconds of media to keep loaded ahead of the position
    pub wanted_buffer_ahead: f64,
    /// Data further ahead than this is garbage collected
    pub max_buffer_ahead: Option<f64>,
    /// Data further behind than this is garbage collected
    pub max_buffer_behind: Option<f64>,
    /// Garbage collection cadence (ms)
    pub gc_interval_ms: u64,
    /// Holes larger than this trigger a discontinuity event
    pub discontinuity_threshold: f64,
    /// Minimum gap from the buffered end under which the buffer counts as
    /// reaching the position
    pub gap_tolerance: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            wanted_buffer_ahead: 30.0,
            max_buffer_ahead: None,
            max_buffer_behind: None,
            gc_interval_ms: 1000,
            discontinuity_threshold: 0.1,
            gap_tolerance: 0.05,
        }
    }
}

impl BufferConfig {
    /// Effective ahead limit for a media type
    pub fn max_ahead_for(&self, media_type: MediaType) -> f64 {
        cap_for(media_type, self.max_buffer_ahead)
    }

    /// Effective behind limit for a media type
    pub fn max_behind_for(&self, media_type: MediaType) -> f64 {
        cap_for(media_type, self.max_buffer_behind)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

fn cap_for(media_type: MediaType, limit: Option<f64>) -> f64 {
    let limit = limit.unwrap_or(f64::INFINITY);
    if media_type.is_lightweight() {
        limit.min(LIGHTWEIGHT_BUFFER_CAP)
    } else {
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AdaptiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request.priority_steps.len(), 6);
        assert_eq!(config.abr.buffer_based_enable_gap, 10.0);
    }

    #[test]
    fn test_partial_json() {
        let config =
            AdaptiveConfig::from_json_str(r#"{ "buffer": { "wanted_buffer_ahead": 12.0 } }"#)
                .unwrap();
        assert_eq!(config.buffer.wanted_buffer_ahead, 12.0);
        assert_eq!(config.request.max_retry_regular, 4);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let json = r#"{ "request": { "high_priority_threshold": 4 } }"#;
        let err = AdaptiveConfig::from_json_str(json).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_lightweight_caps() {
        let buffer = BufferConfig::default();
        assert_eq!(buffer.max_ahead_for(MediaType::Text), LIGHTWEIGHT_BUFFER_CAP);
        assert!(buffer.max_ahead_for(MediaType::Video).is_infinite());
    }

    #[test]
    fn test_backoff_delays_by_mode() {
        let request = RequestConfig::default();
        assert_eq!(request.backoff_delays(true).0, Duration::from_millis(50));
        assert_eq!(request.backoff_delays(false).1, Duration::from_millis(3000));
    }
}
