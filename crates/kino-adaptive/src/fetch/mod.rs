//! Segment fetching
//!
//! - [`SegmentTransport`]: the low-level loader, provided by the host
//! - [`RequestPrioritizer`]: lets urgent requests interrupt speculative ones
//! - [`SegmentScheduler`]: retries and estimator bookkeeping around a load

pub mod backoff;
#[cfg(feature = "http")]
pub mod http;
pub mod prioritizer;
pub mod scheduler;
pub mod transport;

pub use backoff::{BackoffPolicy, RetryDecision, RetryState};
#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use prioritizer::{PrioritizedTask, PriorityHandle, RequestPrioritizer};
pub use scheduler::{segment_priority, SegmentScheduler};
pub use transport::{LoadedSegment, SegmentRequest, SegmentTransport};
