//! Segment scheduler
//!
//! Wraps every segment request of one media type with prioritization,
//! retries with backoff and estimator bookkeeping.

use super::backoff::{BackoffPolicy, RetryDecision, RetryState};
use super::prioritizer::{PrioritizedTask, RequestPrioritizer};
use super::transport::{LoadedSegment, SegmentRequest, SegmentTransport};
use crate::abr::AbrState;
use crate::config::RequestConfig;
use crate::stream::EventSender;
use crate::types::MediaType;
use crate::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Priority of a segment `distance` seconds away from the position: the
/// index of the first step exceeding it
pub fn segment_priority(steps: &[f64], distance: f64) -> i32 {
    steps
        .iter()
        .position(|&step| distance < step)
        .unwrap_or(steps.len()) as i32
}

/// Unregisters a request from the pending registry however it ends
struct RequestGuard<'a> {
    abr: &'a AbrState,
    id: u64,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.abr.request_ended(self.id);
    }
}

/// Loads segments for one media type
pub struct SegmentScheduler {
    media_type: MediaType,
    transport: Arc<dyn SegmentTransport>,
    prioritizer: RequestPrioritizer,
    abr: Arc<AbrState>,
    config: RequestConfig,
    low_latency: bool,
    events: EventSender,
}

impl SegmentScheduler {
    pub fn new(
        media_type: MediaType,
        transport: Arc<dyn SegmentTransport>,
        abr: Arc<AbrState>,
        config: RequestConfig,
        low_latency: bool,
        events: EventSender,
    ) -> Self {
        let prioritizer = RequestPrioritizer::new(
            config.high_priority_threshold,
            config.cancellable_priority_threshold,
        );
        Self {
            media_type,
            transport,
            prioritizer,
            abr,
            config,
            low_latency,
            events,
        }
    }

    pub fn prioritizer(&self) -> &RequestPrioritizer {
        &self.prioritizer
    }

    /// Priority of a segment starting at `segment_time` given the position
    pub fn priority_for(&self, segment_time: f64, position: f64) -> i32 {
        segment_priority(&self.config.priority_steps, segment_time - position)
    }

    /// Register a request with the prioritizer
    pub fn task(&self, priority: i32) -> PrioritizedTask {
        self.prioritizer.task(priority)
    }

    /// Load a segment once `task` is allowed to run, retrying failures
    #[instrument(
        skip(self, request, task, cancel),
        fields(
            media_type = %self.media_type,
            quality = %request.quality.id,
            segment = request.segment.number,
        )
    )]
    pub async fn fetch(
        &self,
        request: SegmentRequest,
        task: PrioritizedTask,
        cancel: &CancellationToken,
    ) -> Result<LoadedSegment> {
        task.run(|token| self.load_with_retry(request.clone(), token), cancel)
            .await
    }

    async fn load_with_retry(
        &self,
        request: SegmentRequest,
        cancel: CancellationToken,
    ) -> Result<LoadedSegment> {
        let mut retry = RetryState::new(BackoffPolicy::from_config(&self.config, self.low_latency));
        loop {
            let progress = self.abr.request_started(&request.quality, &request.segment);
            let outcome = {
                let _guard = RequestGuard {
                    abr: &self.abr,
                    id: progress.id(),
                };
                self.transport.load(&request, &progress, &cancel).await
            };

            let error = match outcome {
                Ok(loaded) => {
                    self.abr.record_metrics(
                        &request.quality,
                        &request.segment,
                        loaded.request_duration,
                        loaded.size,
                    );
                    debug!(
                        bytes = loaded.size,
                        duration_ms = loaded.request_duration.as_millis() as u64,
                        "Segment loaded"
                    );
                    return Ok(loaded);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(error) => error,
            };

            match retry.on_error(&error) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        error = %error,
                        attempt = retry.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Segment request failed, retrying"
                    );
                    self.events.warning(error);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => return Err(retry.into_error(error)),
            }
        }
    }
}

impl std::fmt::Debug for SegmentScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentScheduler")
            .field("media_type", &self.media_type)
            .field("low_latency", &self.low_latency)
            .finish_non_exhaustive()
    }
}
