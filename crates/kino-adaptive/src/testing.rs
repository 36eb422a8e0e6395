//! In-memory collaborators
//!
//! Used by the integration tests and the simulator: a transport whose speed
//! follows a configurable bandwidth, a host buffer recording every call and
//! helpers building simple contents.

use crate::abr::ProgressReporter;
use crate::buffer::{HostBuffer, HostBufferError};
use crate::fetch::{LoadedSegment, SegmentRequest, SegmentTransport};
use crate::ranges::{self, TimeRange};
use crate::types::{MediaType, Period, Quality, Resolution, SegmentIndex, Track};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request recorded by [`SimulatedTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRecord {
    pub media_type: MediaType,
    pub period_id: String,
    pub quality_id: String,
    /// `None` for initialization segments
    pub segment: Option<u64>,
}

/// Transport producing synthetic segments at a simulated bandwidth
///
/// Every segment weighs `bitrate * duration / 8` bytes and takes
/// `size * 8 / bandwidth` seconds of tokio time to arrive, reported in four
/// progress steps.
#[derive(Debug)]
pub struct SimulatedTransport {
    bandwidth: AtomicU64,
    latency: Duration,
    failures: Mutex<VecDeque<Error>>,
    loads: Mutex<Vec<LoadRecord>>,
}

impl SimulatedTransport {
    /// `bandwidth` in bits per second
    pub fn new(bandwidth: u64) -> Self {
        Self {
            bandwidth: AtomicU64::new(bandwidth.max(1)),
            latency: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            loads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_bandwidth(&self, bandwidth: u64) {
        self.bandwidth.store(bandwidth.max(1), Ordering::Relaxed);
    }

    pub fn bandwidth(&self) -> u64 {
        self.bandwidth.load(Ordering::Relaxed)
    }

    /// The next load fails with `error` before transferring anything
    pub fn fail_next(&self, error: Error) {
        self.failures.lock().push_back(error);
    }

    /// Every load started so far, in order
    pub fn loads(&self) -> Vec<LoadRecord> {
        self.loads.lock().clone()
    }

    fn payload(request: &SegmentRequest) -> (Bytes, u64) {
        if request.segment.is_init {
            let data = format!("init:{}:{}", request.period_id, request.quality.id);
            let size = data.len() as u64;
            return (Bytes::from(data), size);
        }
        let size = (request.quality.bitrate as f64 * request.segment.duration / 8.0)
            .round()
            .max(1.0) as u64;
        let data = format!("{}:{}", request.quality.id, request.segment.number);
        (Bytes::from(data), size)
    }
}

#[async_trait]
impl SegmentTransport for SimulatedTransport {
    async fn load(
        &self,
        request: &SegmentRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<LoadedSegment> {
        self.loads.lock().push(LoadRecord {
            media_type: request.media_type,
            period_id: request.period_id.clone(),
            quality_id: request.quality.id.clone(),
            segment: (!request.segment.is_init).then_some(request.segment.number),
        });
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let started = Instant::now();
        let (data, size) = Self::payload(request);
        let transfer = Duration::from_secs_f64(size as f64 * 8.0 / self.bandwidth() as f64);

        let steps = 4u64;
        let step_time = transfer / steps as u32;
        let transfer_all = async {
            tokio::time::sleep(self.latency).await;
            for step in 1..=steps {
                tokio::time::sleep(step_time).await;
                progress.report(size * step / steps, Some(size));
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = transfer_all => {}
        }

        Ok(LoadedSegment {
            data,
            request_duration: started.elapsed().max(Duration::from_millis(1)),
            size,
        })
    }
}

/// Call recorded by [`MemoryHostBuffer`]
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Append { init: bool, range: Option<TimeRange> },
    Remove { start: f64, end: f64 },
}

#[derive(Debug, Default)]
struct MemoryState {
    buffered: Vec<TimeRange>,
    calls: Vec<HostCall>,
    appended: Vec<Bytes>,
    fail_append: VecDeque<String>,
    fail_remove: VecDeque<String>,
}

/// Host buffer keeping buffered ranges in memory
#[derive(Debug, Default)]
pub struct MemoryHostBuffer {
    state: Mutex<MemoryState>,
}

impl MemoryHostBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far, in order
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// Payloads appended so far, in order
    pub fn appended(&self) -> Vec<Bytes> {
        self.state.lock().appended.clone()
    }

    /// The next append is rejected with `message`
    pub fn fail_next_append(&self, message: impl Into<String>) {
        self.state.lock().fail_append.push_back(message.into());
    }

    /// The next removal is rejected with `message`
    pub fn fail_next_remove(&self, message: impl Into<String>) {
        self.state.lock().fail_remove.push_back(message.into());
    }
}

#[async_trait]
impl HostBuffer for MemoryHostBuffer {
    async fn append(&self, data: Bytes, range: Option<TimeRange>) -> std::result::Result<(), HostBufferError> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_append.pop_front() {
            return Err(HostBufferError::new(message));
        }
        state.calls.push(HostCall::Append {
            init: range.is_none(),
            range,
        });
        state.appended.push(data);
        if let Some(range) = range {
            state.buffered.push(range);
            state.buffered = ranges::normalize(&state.buffered);
        }
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> std::result::Result<(), HostBufferError> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_remove.pop_front() {
            return Err(HostBufferError::new(message));
        }
        state.calls.push(HostCall::Remove { start, end });
        let hole = [TimeRange::new(start, end)];
        state.buffered = state
            .buffered
            .iter()
            .flat_map(|r| ranges::subtract(*r, &hole))
            .collect();
        Ok(())
    }

    fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.state.lock().buffered.clone()
    }
}

/// Track with one quality per bitrate, each cut in uniform segments covering
/// `[start, end)`
pub fn ladder_track(
    media_type: MediaType,
    bitrates: &[u64],
    start: f64,
    end: f64,
    segment_duration: f64,
) -> Track {
    let count = ((end - start) / segment_duration).ceil().max(0.0) as u64;
    let with_init = !media_type.is_lightweight();
    let qualities = bitrates
        .iter()
        .map(|&bitrate| {
            let mut index = SegmentIndex::uniform(start, segment_duration, count, with_init);
            if let Some(last) = index.segments.last_mut() {
                last.duration = end - last.time;
            }
            let quality = Quality::new(format!("{media_type}-{bitrate}"), bitrate, index);
            match media_type {
                MediaType::Video => quality
                    .with_codec("avc1.64001f")
                    .with_resolution(resolution_for(bitrate)),
                MediaType::Audio => quality.with_codec("mp4a.40.2"),
                _ => quality,
            }
        })
        .collect();
    Track::new(format!("{media_type}"), media_type, qualities)
}

/// Period with a video ladder and, when given, audio qualities
pub fn ladder_period(
    id: &str,
    start: f64,
    end: f64,
    video: &[u64],
    audio: &[u64],
    segment_duration: f64,
) -> Period {
    let mut period = Period::new(id, start, Some(end));
    if !video.is_empty() {
        period = period.with_track(ladder_track(MediaType::Video, video, start, end, segment_duration));
    }
    if !audio.is_empty() {
        period = period.with_track(ladder_track(MediaType::Audio, audio, start, end, segment_duration));
    }
    period
}

fn resolution_for(bitrate: u64) -> Resolution {
    match bitrate {
        0..=600_000 => Resolution::new(640, 360),
        600_001..=1_500_000 => Resolution::new(854, 480),
        1_500_001..=3_500_000 => Resolution::new(1280, 720),
        3_500_001..=8_000_000 => Resolution::new(1920, 1080),
        _ => Resolution::new(3840, 2160),
    }
}
