//! In-flight request bookkeeping
//!
//! Every segment request registers here when it starts, reports progress
//! while bytes come in and unregisters when it ends, so the estimators can
//! look at requests that have not finished yet.

use super::throughput::Ewma;
use crate::types::{Quality, Segment};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

/// One progress event of a request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestProgress {
    pub timestamp: Instant,
    /// Bytes received so far
    pub size: u64,
    /// Expected total size, when announced by the server
    pub total_size: Option<u64>,
}

/// A request that has started but not ended
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u64,
    pub quality: Arc<Quality>,
    pub segment: Segment,
    pub started_at: Instant,
    pub progress: Vec<RequestProgress>,
}

impl PendingRequest {
    pub fn last_progress(&self) -> Option<&RequestProgress> {
        self.progress.last()
    }

    /// Bandwidth of this single request inferred from its progress events
    pub fn estimate_bandwidth(&self) -> Option<f64> {
        if self.progress.len() < 2 {
            return None;
        }
        let mut ewma = Ewma::new(2.0);
        for pair in self.progress.windows(2) {
            let bytes = pair[1].size.saturating_sub(pair[0].size);
            let elapsed = pair[1]
                .timestamp
                .saturating_duration_since(pair[0].timestamp)
                .as_secs_f64();
            if elapsed <= 0.0 {
                continue;
            }
            ewma.add_sample(elapsed, bytes as f64 * 8.0 / elapsed);
        }
        let estimate = ewma.estimate();
        (estimate > 0.0).then_some(estimate)
    }
}

/// Requests currently in flight for one media type
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    requests: BTreeMap<u64, PendingRequest>,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: PendingRequest) {
        self.requests.insert(request.id, request);
    }

    pub fn add_progress(&mut self, id: u64, progress: RequestProgress) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.progress.push(progress);
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<PendingRequest> {
        self.requests.remove(&id)
    }

    /// Snapshot of in-flight requests, in chronological segment order
    pub fn requests(&self) -> Vec<PendingRequest> {
        let mut requests: Vec<PendingRequest> = self.requests.values().cloned().collect();
        requests.sort_by(|a, b| a.segment.time.total_cmp(&b.segment.time));
        requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Handle given to the transport to report the progress of one request
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    id: u64,
    registry: Arc<Mutex<PendingRequestRegistry>>,
}

impl ProgressReporter {
    pub(crate) fn new(id: u64, registry: Arc<Mutex<PendingRequestRegistry>>) -> Self {
        Self { id, registry }
    }

    /// Reporter not attached to any registry
    pub fn detached() -> Self {
        Self::new(0, Arc::new(Mutex::new(PendingRequestRegistry::new())))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record that `size` bytes out of `total_size` were received
    pub fn report(&self, size: u64, total_size: Option<u64>) {
        self.registry.lock().add_progress(
            self.id,
            RequestProgress {
                timestamp: Instant::now(),
                size,
                total_size,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmentIndex;
    use std::time::Duration;

    fn request(id: u64, time: f64) -> PendingRequest {
        PendingRequest {
            id,
            quality: Arc::new(Quality::new("q", 1_000_000, SegmentIndex::default())),
            segment: Segment::media(id, time, 4.0),
            started_at: Instant::now(),
            progress: Vec::new(),
        }
    }

    #[test]
    fn test_requests_sorted_by_time() {
        let mut registry = PendingRequestRegistry::new();
        registry.add(request(1, 8.0));
        registry.add(request(2, 4.0));
        let times: Vec<f64> = registry.requests().iter().map(|r| r.segment.time).collect();
        assert_eq!(times, vec![4.0, 8.0]);
        registry.remove(2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_bandwidth() {
        let registry = Arc::new(Mutex::new(PendingRequestRegistry::new()));
        registry.lock().add(request(7, 0.0));
        let reporter = ProgressReporter::new(7, Arc::clone(&registry));

        reporter.report(0, Some(500_000));
        tokio::time::advance(Duration::from_secs(1)).await;
        reporter.report(125_000, Some(500_000));
        tokio::time::advance(Duration::from_secs(1)).await;
        reporter.report(250_000, Some(500_000));

        let requests = registry.lock().requests();
        let estimate = requests[0].estimate_bandwidth().unwrap();
        assert!((estimate - 1_000_000.0).abs() < 1.0);
    }
}
