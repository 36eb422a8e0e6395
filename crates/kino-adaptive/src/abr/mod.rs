//! Adaptive Bitrate (ABR) estimation
//!
//! Implements the estimators feeding quality decisions:
//! - Throughput: fast/slow EWMA bandwidth estimation
//! - Maintainability: per-quality download speed vs. playback speed
//! - Network: bitrate ceiling with starvation handling
//! - Buffer level: BOLA-style buffer occupancy heuristic
//! - Probe: optimistic up-switching near the live edge
//!
//! [`QualitySelector`] merges them into [`Estimate`](crate::types::Estimate)s.

pub mod buffer_level;
pub mod filters;
pub mod maintainability;
pub mod network;
pub mod pending;
pub mod probe;
pub mod selector;
pub mod throughput;

pub use buffer_level::{BufferLevelChooser, BufferLevelInput};
pub use filters::{select_optimal, QualityFilters};
pub use maintainability::{MaintainabilityScore, MaintainabilityTracker, ScoreConfidence};
pub use network::{BandwidthDecision, NetworkRateAnalyzer};
pub use pending::{PendingRequest, PendingRequestRegistry, ProgressReporter, RequestProgress};
pub use probe::{EstimateSource, LastEstimate, ProbeChooser};
pub use selector::QualitySelector;
pub use throughput::ThroughputEstimator;

use crate::config::AbrConfig;
use crate::types::{Quality, Segment};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Constraints set by the application on the automatic choice
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityConstraints {
    /// Forces the highest quality at or below this bitrate
    pub manual_bitrate: Option<u64>,
    /// Automatic choices never go below this bitrate
    pub min_auto_bitrate: u64,
    /// Automatic choices never go above this bitrate
    pub max_auto_bitrate: Option<u64>,
    /// Filters applied before choosing
    pub filters: QualityFilters,
}

/// Estimator state shared by every period of one media type
#[derive(Debug)]
pub struct AbrState {
    pub throughput: Mutex<ThroughputEstimator>,
    pub maintainability: Mutex<MaintainabilityTracker>,
    pub pending: Arc<Mutex<PendingRequestRegistry>>,
    next_request_id: AtomicU64,
}

impl AbrState {
    pub fn new(config: &AbrConfig) -> Self {
        Self {
            throughput: Mutex::new(ThroughputEstimator::new(config)),
            maintainability: Mutex::new(MaintainabilityTracker::new()),
            pending: Arc::new(Mutex::new(PendingRequestRegistry::new())),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Register a request that is about to start
    pub fn request_started(&self, quality: &Arc<Quality>, segment: &Segment) -> ProgressReporter {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().add(PendingRequest {
            id,
            quality: Arc::clone(quality),
            segment: segment.clone(),
            started_at: Instant::now(),
            progress: Vec::new(),
        });
        ProgressReporter::new(id, Arc::clone(&self.pending))
    }

    /// Unregister a request, whatever its outcome
    pub fn request_ended(&self, id: u64) {
        self.pending.lock().remove(id);
    }

    /// Feed the estimators with a completed request
    pub fn record_metrics(
        &self,
        quality: &Arc<Quality>,
        segment: &Segment,
        request_duration: Duration,
        size: u64,
    ) {
        self.throughput
            .lock()
            .add_sample(request_duration, size, false);
        if !segment.is_init {
            self.maintainability
                .lock()
                .add_sample(quality, request_duration, segment.duration);
        }
    }
}
