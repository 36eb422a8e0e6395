//! Retry with exponential backoff
//!
//! Failures caused by the lack of connectivity and regular failures are
//! counted separately: a request failing because the device went offline
//! usually deserves many more attempts than one failing on a server error.

use crate::config::RequestConfig;
use crate::Error;
use rand::Rng;
use std::time::Duration;

/// Delays and budgets for one kind of request
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub fuzz_factor: f64,
    pub max_retry_regular: u32,
    pub max_retry_offline: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &RequestConfig, low_latency: bool) -> Self {
        let (base_delay, max_delay) = config.backoff_delays(low_latency);
        Self {
            base_delay,
            max_delay,
            fuzz_factor: config.fuzz_factor,
            max_retry_regular: config.max_retry_regular,
            max_retry_offline: config.max_retry_offline,
        }
    }

    /// Un-fuzzed delay before the `retry_count`-th retry (starting at 1)
    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay randomized by up to `fuzz_factor` in both directions
    pub fn fuzzed_delay(&self, retry_count: u32) -> Duration {
        let delay = self.delay(retry_count);
        if self.fuzz_factor <= 0.0 {
            return delay;
        }
        let fuzz = rand::thread_rng().gen_range(-self.fuzz_factor..=self.fuzz_factor);
        delay.mul_f64((1.0 + fuzz).max(0.0))
    }
}

/// What to do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Regular,
    Offline,
}

/// Retry bookkeeping for one request
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: BackoffPolicy,
    retry_count: u32,
    attempts: u32,
    last_kind: Option<FailureKind>,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            retry_count: 0,
            attempts: 0,
            last_kind: None,
        }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decide whether the request should be attempted again after `error`
    pub fn on_error(&mut self, error: &Error) -> RetryDecision {
        self.attempts += 1;
        if !error.is_recoverable() {
            return RetryDecision::GiveUp;
        }
        let kind = if error.is_offline() {
            FailureKind::Offline
        } else {
            FailureKind::Regular
        };
        if self.last_kind != Some(kind) {
            self.retry_count = 0;
            self.last_kind = Some(kind);
        }
        let budget = match kind {
            FailureKind::Regular => self.policy.max_retry_regular,
            FailureKind::Offline => self.policy.max_retry_offline,
        };
        if self.retry_count >= budget {
            return RetryDecision::GiveUp;
        }
        self.retry_count += 1;
        RetryDecision::Retry(self.policy.fuzzed_delay(self.retry_count))
    }

    /// Final error once retrying was given up
    pub fn into_error(self, error: Error) -> Error {
        if error.is_recoverable() {
            Error::RetriesExhausted {
                attempts: self.attempts,
                source: Box::new(error),
            }
        } else {
            error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            fuzz_factor: 0.0,
            ..BackoffPolicy::from_config(&RequestConfig::default(), false)
        }
    }

    fn timeout() -> Error {
        Error::SegmentTimeout {
            url: "https://cdn.example.com/seg.m4s".into(),
        }
    }

    #[test]
    fn test_delay_doubles_up_to_max() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(1600));
        assert_eq!(policy.delay(5), Duration::from_millis(3000));
        assert_eq!(policy.delay(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_fuzz_stays_in_bounds() {
        let policy = BackoffPolicy::from_config(&RequestConfig::default(), true);
        for _ in 0..100 {
            let delay = policy.fuzzed_delay(1);
            assert!(delay >= Duration::from_millis(34) && delay <= Duration::from_millis(66));
        }
    }

    #[test]
    fn test_regular_budget() {
        let mut state = RetryState::new(policy());
        for _ in 0..4 {
            assert!(matches!(state.on_error(&timeout()), RetryDecision::Retry(_)));
        }
        assert_eq!(state.on_error(&timeout()), RetryDecision::GiveUp);
        let err = state.into_error(timeout());
        assert_eq!(err.error_code(), "RETRIES_EXHAUSTED");
    }

    #[test]
    fn test_switching_kind_resets_count() {
        let mut state = RetryState::new(policy());
        for _ in 0..4 {
            state.on_error(&timeout());
        }
        let offline = Error::SegmentOffline {
            url: "https://cdn.example.com/seg.m4s".into(),
        };
        assert_eq!(
            state.on_error(&offline),
            RetryDecision::Retry(Duration::from_millis(200))
        );
        assert!(matches!(state.on_error(&timeout()), RetryDecision::Retry(_)));
    }

    #[test]
    fn test_fatal_errors_are_not_retried() {
        let mut state = RetryState::new(policy());
        let forbidden = Error::SegmentHttp {
            url: "https://cdn.example.com/seg.m4s".into(),
            status: 403,
        };
        assert_eq!(state.on_error(&forbidden), RetryDecision::GiveUp);
        assert_eq!(state.into_error(forbidden.clone()), forbidden);
    }
}
