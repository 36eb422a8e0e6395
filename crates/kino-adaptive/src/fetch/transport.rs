//! Segment transport abstraction

use crate::abr::ProgressReporter;
use crate::types::{MediaType, Quality, Segment};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What to load
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub media_type: MediaType,
    pub period_id: String,
    pub quality: Arc<Quality>,
    pub segment: Segment,
}

impl SegmentRequest {
    /// Human readable location, used in errors and logs
    pub fn location(&self) -> String {
        match &self.segment.url {
            Some(url) => url.to_string(),
            None if self.segment.is_init => format!("{}/{}/init", self.period_id, self.quality.id),
            None => format!(
                "{}/{}/{}",
                self.period_id, self.quality.id, self.segment.number
            ),
        }
    }
}

/// Result of a successful load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSegment {
    pub data: Bytes,
    /// Wall-clock time the request took
    pub request_duration: Duration,
    /// Bytes transferred
    pub size: u64,
}

/// Low-level segment loader.
///
/// Failures must be reported with the segment request variants of
/// [`Error`](crate::Error) (`SegmentHttp`, `SegmentTimeout`,
/// `SegmentOffline`, ...) so that they can be classified for retries.
#[async_trait]
pub trait SegmentTransport: Send + Sync {
    /// Load a segment, reporting progress as bytes arrive, and give up with
    /// `Error::Cancelled` as soon as `cancel` is cancelled
    async fn load(
        &self,
        request: &SegmentRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<LoadedSegment>;
}
