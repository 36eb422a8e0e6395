//! Loading of one media type for one period
//!
//! A [`PeriodStream`] keeps the buffer filled up to the wanted horizon with
//! segments of the quality picked by its [`QualitySelector`], one download
//! at a time. It re-evaluates on every observation, constraint or goal
//! change and whenever a download completes.

use super::events::{EventSender, StreamEvent};
use super::needed::{is_period_complete, needed_segments, wanted_range};
use crate::abr::{AbrState, QualityConstraints, QualitySelector};
use crate::buffer::{BufferGoals, BufferSink, ChunkInfo};
use crate::config::{AbrConfig, BufferConfig};
use crate::fetch::{LoadedSegment, PriorityHandle, SegmentRequest, SegmentScheduler};
use crate::ranges;
use crate::reference::SharedReference;
use crate::types::{
    Estimate, MediaType, Period, PlaybackObservation, Quality, QueueItem, Segment,
};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Lifecycle of a period stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodStreamStatus {
    /// Loading, nothing pushed yet
    Loading,
    /// Loading, at least one segment pushed
    Active,
    /// Nothing needed within the wanted horizon
    Full,
    /// Torn down
    Cleared,
}

impl std::fmt::Display for PeriodStreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodStreamStatus::Loading => write!(f, "loading"),
            PeriodStreamStatus::Active => write!(f, "active"),
            PeriodStreamStatus::Full => write!(f, "full"),
            PeriodStreamStatus::Cleared => write!(f, "cleared"),
        }
    }
}

/// Observable state of a period stream
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodStreamState {
    pub status: PeriodStreamStatus,
    /// A segment was pushed, or there is nothing to push for this type
    pub ready: bool,
    /// Everything up to the end of the period is buffered
    pub complete: bool,
    /// Fatal error that stopped the stream
    pub error: Option<Error>,
}

impl Default for PeriodStreamState {
    fn default() -> Self {
        Self {
            status: PeriodStreamStatus::Loading,
            ready: false,
            complete: false,
            error: None,
        }
    }
}

/// Everything a period stream shares with the other streams of its type
#[derive(Clone)]
pub struct StreamContext {
    pub media_type: MediaType,
    pub sink: Arc<BufferSink>,
    pub scheduler: Arc<SegmentScheduler>,
    pub abr: Arc<AbrState>,
    pub abr_config: AbrConfig,
    pub buffer_config: BufferConfig,
    pub observation: SharedReference<PlaybackObservation>,
    pub constraints: SharedReference<QualityConstraints>,
    pub goals: SharedReference<BufferGoals>,
    pub estimate: SharedReference<Option<Arc<Estimate>>>,
    pub events: EventSender,
}

/// Handle to a running period stream
#[derive(Debug)]
pub struct PeriodStreamHandle {
    pub period: Arc<Period>,
    state: SharedReference<PeriodStreamState>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PeriodStreamHandle {
    pub fn state(&self) -> PeriodStreamState {
        self.state.get()
    }

    /// Shared state, to register callbacks on
    pub fn state_reference(&self) -> &SharedReference<PeriodStreamState> {
        &self.state
    }

    /// Token cancelled when the stream is torn down
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop loading; in-flight requests are aborted
    pub fn clear(&self) {
        self.cancel.cancel();
        self.state.update(|s| s.status = PeriodStreamStatus::Cleared);
    }

    /// Clear and wait for the stream task to finish
    pub async fn shutdown(self) {
        self.clear();
        let _ = self.join.await;
    }
}

struct InFlight {
    quality: Arc<Quality>,
    segment: Segment,
    priority: PriorityHandle,
    cancel: CancellationToken,
    join: JoinHandle<Result<LoadedSegment>>,
}

async fn wait_in_flight(in_flight: &mut Option<InFlight>) -> Result<LoadedSegment> {
    match in_flight {
        Some(download) => match (&mut download.join).await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("download task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

/// One media type of one period
pub struct PeriodStream {
    ctx: StreamContext,
    period: Arc<Period>,
    state: SharedReference<PeriodStreamState>,
    selector: QualitySelector,
    current: Option<Arc<Quality>>,
    init_data: HashMap<String, Bytes>,
    refresh_requested: bool,
    last_discontinuity: Option<f64>,
}

impl PeriodStream {
    /// Start loading `period` for `ctx.media_type`
    pub fn spawn(ctx: StreamContext, period: Arc<Period>, cancel: CancellationToken) -> PeriodStreamHandle {
        let state = SharedReference::new(PeriodStreamState::default());
        let selector = QualitySelector::new(ctx.media_type, &ctx.abr_config, Arc::clone(&ctx.abr));
        let stream = PeriodStream {
            ctx,
            period: Arc::clone(&period),
            state: state.clone(),
            selector,
            current: None,
            init_data: HashMap::new(),
            refresh_requested: false,
            last_discontinuity: None,
        };
        let join = tokio::spawn(stream.run(cancel.clone()));
        PeriodStreamHandle {
            period,
            state,
            cancel,
            join,
        }
    }

    #[instrument(skip_all, fields(media_type = %self.ctx.media_type, period = %self.period.id))]
    async fn run(mut self, cancel: CancellationToken) {
        if self.period.track(self.ctx.media_type).is_none() {
            debug!("No track for this period");
            self.set_state(|s| {
                s.status = PeriodStreamStatus::Full;
                s.ready = true;
                s.complete = true;
            });
            self.ctx.events.emit(StreamEvent::PeriodStreamReady {
                media_type: self.ctx.media_type,
                period_id: self.period.id.clone(),
            });
            return;
        }

        info!(start = self.period.start, end = ?self.period.end, "Period stream created");
        let result = self.load_loop(&cancel).await;
        match result {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(error) => {
                warn!(error = %error, "Period stream stopped");
                self.ctx.events.emit(StreamEvent::Error {
                    media_type: self.ctx.media_type,
                    error: error.clone(),
                });
                self.set_state(|s| s.error = Some(error));
            }
        }
        self.set_state(|s| s.status = PeriodStreamStatus::Cleared);
        debug!("Period stream finished");
    }

    async fn load_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut observation_rx = self.ctx.observation.subscribe();
        let mut constraints_rx = self.ctx.constraints.subscribe();
        let mut goals_rx = self.ctx.goals.subscribe();
        let mut in_flight: Option<InFlight> = None;

        let outcome = loop {
            if let Err(e) = self.step(&mut in_flight, cancel) {
                break Err(e);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                result = wait_in_flight(&mut in_flight) => {
                    let Some(download) = in_flight.take() else {
                        continue;
                    };
                    match result {
                        Ok(loaded) => {
                            if let Err(e) = self.on_loaded(download, loaded, cancel).await {
                                break Err(e);
                            }
                        }
                        Err(Error::Cancelled) => {}
                        Err(e) => break Err(e),
                    }
                }
                changed = observation_rx.changed() => if changed.is_err() { break Ok(()) },
                changed = constraints_rx.changed() => if changed.is_err() { break Ok(()) },
                changed = goals_rx.changed() => if changed.is_err() { break Ok(()) },
            }
        };

        if let Some(download) = in_flight.take() {
            download.cancel.cancel();
        }
        outcome
    }

    /// Re-evaluate the estimate and start a download when one is needed
    fn step(&mut self, in_flight: &mut Option<InFlight>, cancel: &CancellationToken) -> Result<()> {
        let media_type = self.ctx.media_type;
        let Some(track) = self.period.track(media_type) else {
            return Ok(());
        };
        let observation = self.ctx.observation.get();
        let buffered = self.ctx.sink.buffered_ranges();
        let observation =
            observation.with_buffer_gap(ranges::buffer_gap(&buffered, observation.position));

        let qualities = track.playable_qualities();
        let estimate = self.selector.estimate(
            &qualities,
            &observation,
            self.current.as_ref(),
            &self.ctx.constraints.get(),
            Instant::now(),
        )?;
        let chosen = Arc::clone(&estimate.quality);
        let urgent = estimate.urgent;
        self.ctx.estimate.set_if_changed(Some(Arc::new(estimate)));

        let switched = self
            .current
            .as_ref()
            .map_or(true, |current| !Arc::ptr_eq(current, &chosen));
        if switched {
            info!(
                quality = %chosen.id,
                bitrate = chosen.bitrate,
                urgent,
                "Switching quality"
            );
            self.ctx.events.emit(StreamEvent::QualityChanged {
                media_type,
                period_id: self.period.id.clone(),
                quality_id: chosen.id.clone(),
                bitrate: chosen.bitrate,
            });
            self.current = Some(Arc::clone(&chosen));
        }

        if let Some(download) = in_flight.as_ref() {
            let obsolete = urgent && !Arc::ptr_eq(&download.quality, &chosen);
            if !obsolete {
                let priority = self
                    .ctx
                    .scheduler
                    .priority_for(download.segment.time, observation.position);
                download.priority.update(priority);
                return Ok(());
            }
            debug!(segment = download.segment.number, "Aborting request for previous quality");
            download.cancel.cancel();
            *in_flight = None;
        }

        self.check_discontinuity(&chosen, &observation);

        let goals = self.ctx.goals.get();
        let tolerance = self.ctx.buffer_config.gap_tolerance;
        let wanted = wanted_range(&self.period, observation.position, goals.effective_ahead());
        let inventory = self.ctx.sink.inventory();
        let needed = needed_segments(
            &chosen,
            &self.period,
            wanted,
            observation.position,
            &inventory,
            tolerance,
        );

        let refresh = chosen.index.should_refresh(wanted.start, wanted.end);
        if refresh && !self.refresh_requested {
            self.ctx.events.emit(StreamEvent::NeedsManifestRefresh);
        }
        self.refresh_requested = refresh;

        // rebuilt on every step, superseding the previous one
        let queue: Vec<QueueItem> = needed
            .iter()
            .map(|segment| QueueItem {
                segment: segment.clone(),
                priority: self.ctx.scheduler.priority_for(segment.time, observation.position),
            })
            .collect();

        let Some(next) = queue.first() else {
            let complete = is_period_complete(&chosen, &self.period, wanted, &needed, tolerance);
            self.set_state(|s| {
                if s.status != PeriodStreamStatus::Full {
                    debug!(complete, "Buffer full");
                }
                s.status = PeriodStreamStatus::Full;
                s.complete = complete;
            });
            return Ok(());
        };

        self.set_state(|s| {
            s.status = if s.ready {
                PeriodStreamStatus::Active
            } else {
                PeriodStreamStatus::Loading
            };
            s.complete = false;
        });

        let segment = match &chosen.index.init {
            Some(init) if !self.init_data.contains_key(&chosen.id) => init.clone(),
            _ => next.segment.clone(),
        };
        *in_flight = Some(self.start_download(chosen, segment, next.priority, cancel));
        Ok(())
    }

    fn start_download(
        &self,
        quality: Arc<Quality>,
        segment: Segment,
        priority: i32,
        cancel: &CancellationToken,
    ) -> InFlight {
        debug!(
            quality = %quality.id,
            segment = segment.number,
            init = segment.is_init,
            priority,
            "Requesting segment"
        );
        let request = SegmentRequest {
            media_type: self.ctx.media_type,
            period_id: self.period.id.clone(),
            quality: Arc::clone(&quality),
            segment: segment.clone(),
        };
        let task = self.ctx.scheduler.task(priority);
        let handle = task.handle();
        let token = cancel.child_token();
        let scheduler = Arc::clone(&self.ctx.scheduler);
        let download_token = token.clone();
        let join = tokio::spawn(async move { scheduler.fetch(request, task, &download_token).await });
        InFlight {
            quality,
            segment,
            priority: handle,
            cancel: token,
            join,
        }
    }

    async fn on_loaded(
        &mut self,
        download: InFlight,
        loaded: LoadedSegment,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let quality = download.quality;
        if download.segment.is_init {
            self.init_data.insert(quality.id.clone(), loaded.data);
            return Ok(());
        }

        let info = ChunkInfo {
            period_id: self.period.id.clone(),
            quality: Arc::clone(&quality),
            segment: download.segment,
        };
        let init = self.init_data.get(&quality.id).cloned();
        let sink = Arc::clone(&self.ctx.sink);
        let pushed = async {
            sink.push_chunk(loaded.data, init, info.clone()).await?;
            sink.end_of_segment(info.clone()).await
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = pushed => result?,
        }
        debug!(quality = %quality.id, segment = info.segment.number, "Segment pushed");

        let first_push = !self.state.get().ready;
        if first_push {
            self.set_state(|s| {
                s.ready = true;
                s.status = PeriodStreamStatus::Active;
            });
            self.ctx.events.emit(StreamEvent::PeriodStreamReady {
                media_type: self.ctx.media_type,
                period_id: self.period.id.clone(),
            });
        }

        if let Some(track) = self.period.track(self.ctx.media_type) {
            let observation = self.ctx.observation.get();
            let buffered = self.ctx.sink.buffered_ranges();
            self.selector.on_segment_appended(
                &track.playable_qualities(),
                &quality,
                &buffered,
                &observation,
            );
        }
        Ok(())
    }

    fn check_discontinuity(&mut self, quality: &Quality, observation: &PlaybackObservation) {
        if !self.period.contains(observation.position) || observation.buffer_gap > 0.0 {
            return;
        }
        let Some(next) = quality.index.check_discontinuity(observation.position) else {
            return;
        };
        if next - observation.position <= self.ctx.buffer_config.discontinuity_threshold {
            return;
        }
        if self.last_discontinuity == Some(next) {
            return;
        }
        self.last_discontinuity = Some(next);
        warn!(position = observation.position, next, "Discontinuity encountered");
        self.ctx.events.emit(StreamEvent::DiscontinuityEncountered {
            media_type: self.ctx.media_type,
            gap_start: observation.position,
            next,
        });
    }

    fn set_state(&self, f: impl FnOnce(&mut PeriodStreamState)) {
        let mut state = self.state.get();
        if state.status == PeriodStreamStatus::Cleared {
            return;
        }
        f(&mut state);
        self.state.set_if_changed(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HostBuffer;
    use crate::config::{AdaptiveConfig, RequestConfig};
    use crate::stream::events;
    use crate::testing::{ladder_period, MemoryHostBuffer, SimulatedTransport};
    use std::time::Duration;

    fn context(
        transport: Arc<SimulatedTransport>,
        host: Arc<MemoryHostBuffer>,
        ahead: f64,
    ) -> (StreamContext, tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) {
        let config = AdaptiveConfig::default();
        let (events, rx) = events::channel();
        let abr = Arc::new(AbrState::new(&config.abr));
        let scheduler = Arc::new(SegmentScheduler::new(
            MediaType::Video,
            transport,
            Arc::clone(&abr),
            RequestConfig::default(),
            false,
            events.clone(),
        ));
        let goals = BufferGoals {
            wanted_ahead: ahead,
            ..BufferGoals::from_config(&config.buffer, MediaType::Video)
        };
        let ctx = StreamContext {
            media_type: MediaType::Video,
            sink: Arc::new(BufferSink::new(MediaType::Video, host, 0.05)),
            scheduler,
            abr,
            abr_config: config.abr.clone(),
            buffer_config: config.buffer.clone(),
            observation: SharedReference::new(PlaybackObservation::at(0.0)),
            constraints: SharedReference::new(QualityConstraints::default()),
            goals: SharedReference::new(goals),
            estimate: SharedReference::new(None),
            events,
        };
        (ctx, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fills_up_to_wanted_horizon() {
        let transport = Arc::new(SimulatedTransport::new(10_000_000));
        let host = Arc::new(MemoryHostBuffer::new());
        let (ctx, mut rx) = context(transport.clone(), host.clone(), 10.0);
        let period = Arc::new(ladder_period("p0", 0.0, 40.0, &[1_000_000], &[], 4.0));

        let handle = PeriodStream::spawn(ctx, period, CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(30)).await;

        let state = handle.state();
        assert_eq!(state.status, PeriodStreamStatus::Full);
        assert!(state.ready);
        assert!(!state.complete);
        assert_eq!(host.buffered_ranges(), vec![crate::ranges::TimeRange::new(0.0, 12.0)]);

        let loads: Vec<Option<u64>> = transport.loads().iter().map(|l| l.segment).collect();
        assert_eq!(loads, vec![None, Some(1), Some(2), Some(3)]);

        let mut ready = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, StreamEvent::PeriodStreamReady { .. }) {
                ready += 1;
            }
        }
        assert_eq!(ready, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_at_period_end() {
        let transport = Arc::new(SimulatedTransport::new(10_000_000));
        let host = Arc::new(MemoryHostBuffer::new());
        let (ctx, _rx) = context(transport, host, 30.0);
        let period = Arc::new(ladder_period("p0", 0.0, 10.0, &[1_000_000], &[], 4.0));

        let handle = PeriodStream::spawn(ctx, period, CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(30)).await;
        let state = handle.state();
        assert!(state.complete);
        assert_eq!(state.status, PeriodStreamStatus::Full);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_track_is_immediately_complete() {
        let transport = Arc::new(SimulatedTransport::new(10_000_000));
        let host = Arc::new(MemoryHostBuffer::new());
        let (ctx, _rx) = context(transport.clone(), host, 30.0);
        let period = Arc::new(ladder_period("p0", 0.0, 10.0, &[], &[128_000], 4.0));

        let handle = PeriodStream::spawn(ctx, period, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = handle.state();
        assert!(state.ready && state.complete);
        assert!(transport.loads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_failure_stops_stream() {
        let transport = Arc::new(SimulatedTransport::new(10_000_000));
        let host = Arc::new(MemoryHostBuffer::new());
        host.fail_next_append("decode error");
        let (ctx, mut rx) = context(transport, host, 30.0);
        let period = Arc::new(ladder_period("p0", 0.0, 10.0, &[1_000_000], &[], 4.0));

        let handle = PeriodStream::spawn(ctx, period, CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(5)).await;
        let state = handle.state();
        assert!(matches!(state.error, Some(Error::BufferAppend { .. })));
        assert_eq!(state.status, PeriodStreamStatus::Cleared);

        let mut errors = 0;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Error { media_type, .. } = event {
                assert_eq!(media_type, MediaType::Video);
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
    }
}
