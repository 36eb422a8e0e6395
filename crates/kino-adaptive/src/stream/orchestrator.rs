//! Stream orchestration
//!
//! The [`StreamOrchestrator`] owns one pipeline per media type: a buffer
//! sink, a segment scheduler, the estimator state shared across periods and
//! a loop keeping the list of running [`PeriodStream`]s consistent with the
//! playback position.
//!
//! ```text
//!            observation / controls
//!                     │
//!      ┌──────────────┼──────────────┐
//!      ▼              ▼              ▼
//!  video loop     audio loop     text loop      (one per media type)
//!      │
//!      ├── PeriodStream p0 ──┐
//!      └── PeriodStream p1 ──┼──► SegmentScheduler ──► SegmentTransport
//!                            └──► BufferSink ──► HostBuffer
//! ```

use super::active_period::ActivePeriodTracker;
use super::events::{self, EventSender, StreamEvent};
use super::period::{PeriodStream, PeriodStreamHandle, StreamContext};
use crate::abr::{AbrState, QualityConstraints};
use crate::buffer::{BufferGoals, BufferSink, HostBuffer};
use crate::config::AdaptiveConfig;
use crate::fetch::{SegmentScheduler, SegmentTransport};
use crate::manifest::{DecipherabilityUpdate, Manifest};
use crate::reference::SharedReference;
use crate::types::{Estimate, MediaType, Period, PlaybackObservation, Resolution};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Announces end of stream once every media type is complete, and resumes
/// it when one of them needs data again
#[derive(Debug)]
struct CompletionTracker {
    media_types: Vec<MediaType>,
    complete: HashSet<MediaType>,
    ended: bool,
}

impl CompletionTracker {
    fn new(media_types: &[MediaType]) -> Self {
        Self {
            media_types: media_types.to_vec(),
            complete: HashSet::new(),
            ended: false,
        }
    }

    fn set(&mut self, media_type: MediaType, complete: bool) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if complete {
            if self.complete.insert(media_type) {
                events.push(StreamEvent::BufferComplete(media_type));
            }
        } else {
            self.complete.remove(&media_type);
        }

        let all = self.media_types.iter().all(|t| self.complete.contains(t));
        if all && !self.ended {
            self.ended = true;
            events.push(StreamEvent::EndOfStream);
        } else if !all && self.ended {
            self.ended = false;
            events.push(StreamEvent::ResumeStream);
        }
        events
    }
}

/// Per media type state owned by the orchestrator
struct Pipeline {
    sink: Arc<BufferSink>,
    abr: Arc<AbrState>,
    scheduler: Arc<SegmentScheduler>,
    constraints: SharedReference<QualityConstraints>,
    goals: SharedReference<BufferGoals>,
    estimate: SharedReference<Option<Arc<Estimate>>>,
}

/// Drives loading for every media type
pub struct StreamOrchestrator {
    manifest: Arc<dyn Manifest>,
    config: AdaptiveConfig,
    observation: SharedReference<PlaybackObservation>,
    pipelines: BTreeMap<MediaType, Pipeline>,
    events: EventSender,
    active: Arc<Mutex<ActivePeriodTracker>>,
    completion: Arc<Mutex<CompletionTracker>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamOrchestrator {
    /// Create pipelines for every media type given a host buffer.
    ///
    /// Must be called from within a tokio runtime. Loading starts with
    /// [`start`](Self::start).
    pub fn new(
        manifest: Arc<dyn Manifest>,
        transport: Arc<dyn SegmentTransport>,
        hosts: Vec<(MediaType, Arc<dyn HostBuffer>)>,
        config: AdaptiveConfig,
        observation: SharedReference<PlaybackObservation>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StreamEvent>)> {
        config.validate()?;
        if hosts.is_empty() {
            return Err(Error::InvalidConfig("at least one host buffer is needed".into()));
        }
        let (events, rx) = events::channel();

        let mut pipelines = BTreeMap::new();
        for (media_type, host) in hosts {
            let abr = Arc::new(AbrState::new(&config.abr));
            let scheduler = Arc::new(SegmentScheduler::new(
                media_type,
                Arc::clone(&transport),
                Arc::clone(&abr),
                config.request.clone(),
                config.abr.low_latency,
                events.clone(),
            ));
            let pipeline = Pipeline {
                sink: Arc::new(BufferSink::new(media_type, host, config.buffer.gap_tolerance)),
                abr,
                scheduler,
                constraints: SharedReference::new(QualityConstraints::default()),
                goals: SharedReference::new(BufferGoals::from_config(&config.buffer, media_type)),
                estimate: SharedReference::new(None),
            };
            pipelines.insert(media_type, pipeline);
        }

        let media_types: Vec<MediaType> = pipelines.keys().copied().collect();
        let orchestrator = Self {
            manifest,
            config,
            observation,
            pipelines,
            events,
            active: Arc::new(Mutex::new(ActivePeriodTracker::new(&media_types))),
            completion: Arc::new(Mutex::new(CompletionTracker::new(&media_types))),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        Ok((orchestrator, rx))
    }

    /// Start every pipeline
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!(media_types = ?self.media_types(), "Starting streams");
        for (&media_type, pipeline) in &self.pipelines {
            let cancel = self.cancel.child_token();

            let events = self.events.clone();
            pipeline.estimate.on_update(
                move |estimate| {
                    if let Some(estimate) = estimate {
                        events.emit(StreamEvent::EstimateChanged {
                            media_type,
                            estimate: Arc::clone(estimate),
                        });
                    }
                },
                cancel.child_token(),
                false,
            );

            tasks.push(pipeline.sink.spawn_garbage_collection(
                self.observation.clone(),
                pipeline.goals.clone(),
                self.config.buffer.gc_interval(),
                cancel.child_token(),
            ));

            let type_loop = TypeLoop {
                ctx: StreamContext {
                    media_type,
                    sink: Arc::clone(&pipeline.sink),
                    scheduler: Arc::clone(&pipeline.scheduler),
                    abr: Arc::clone(&pipeline.abr),
                    abr_config: self.config.abr.clone(),
                    buffer_config: self.config.buffer.clone(),
                    observation: self.observation.clone(),
                    constraints: pipeline.constraints.clone(),
                    goals: pipeline.goals.clone(),
                    estimate: pipeline.estimate.clone(),
                    events: self.events.clone(),
                },
                manifest: Arc::clone(&self.manifest),
                streams: VecDeque::new(),
                notify: Arc::new(Notify::new()),
                active: Arc::clone(&self.active),
                completion: Arc::clone(&self.completion),
                cancel,
                bounds_warning: false,
            };
            tasks.push(tokio::spawn(type_loop.run()));
        }
    }

    /// Stop every pipeline and wait for their tasks
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Streams stopped");
    }

    pub fn media_types(&self) -> Vec<MediaType> {
        self.pipelines.keys().copied().collect()
    }

    /// Period currently playable for every media type
    pub fn active_period(&self) -> Option<String> {
        self.active.lock().active().map(str::to_string)
    }

    /// Latest estimate for a media type
    pub fn estimate(&self, media_type: MediaType) -> Option<Arc<Estimate>> {
        self.pipelines.get(&media_type)?.estimate.get()
    }

    /// Stream of estimates for a media type
    pub fn subscribe_estimates(
        &self,
        media_type: MediaType,
    ) -> Option<watch::Receiver<Option<Arc<Estimate>>>> {
        Some(self.pipelines.get(&media_type)?.estimate.subscribe())
    }

    /// Buffer sink of a media type
    pub fn sink(&self, media_type: MediaType) -> Option<Arc<BufferSink>> {
        self.pipelines.get(&media_type).map(|p| Arc::clone(&p.sink))
    }

    /// Force the best quality at or below `bitrate`, or go back to automatic
    /// choices with `None`
    pub fn set_manual_bitrate(&self, media_type: MediaType, bitrate: Option<u64>) -> Result<()> {
        self.update_constraints(media_type, |c| c.manual_bitrate = bitrate)
    }

    pub fn set_min_auto_bitrate(&self, media_type: MediaType, bitrate: u64) -> Result<()> {
        self.update_constraints(media_type, |c| c.min_auto_bitrate = bitrate)
    }

    pub fn set_max_auto_bitrate(&self, media_type: MediaType, bitrate: Option<u64>) -> Result<()> {
        self.update_constraints(media_type, |c| c.max_auto_bitrate = bitrate)
    }

    /// Exclude qualities larger than `limit`
    pub fn set_resolution_limit(
        &self,
        media_type: MediaType,
        limit: Option<Resolution>,
    ) -> Result<()> {
        self.update_constraints(media_type, |c| c.filters.resolution_limit = limit)
    }

    /// Exclude qualities above `ceiling`
    pub fn set_bitrate_ceiling(&self, media_type: MediaType, ceiling: Option<u64>) -> Result<()> {
        self.update_constraints(media_type, |c| c.filters.bitrate_ceiling = ceiling)
    }

    pub fn set_wanted_buffer_ahead(&self, media_type: MediaType, seconds: f64) -> Result<()> {
        if seconds <= 0.0 {
            return Err(Error::InvalidConfig(
                "wanted buffer ahead must be positive".into(),
            ));
        }
        self.update_goals(media_type, |g, _| g.wanted_ahead = seconds)
    }

    pub fn set_max_buffer_ahead(&self, media_type: MediaType, seconds: Option<f64>) -> Result<()> {
        self.update_goals(media_type, |g, config| {
            let mut buffer = config.buffer.clone();
            buffer.max_buffer_ahead = seconds;
            g.max_ahead = buffer.max_ahead_for(media_type);
        })
    }

    pub fn set_max_buffer_behind(&self, media_type: MediaType, seconds: Option<f64>) -> Result<()> {
        self.update_goals(media_type, |g, config| {
            let mut buffer = config.buffer.clone();
            buffer.max_buffer_behind = seconds;
            g.max_behind = buffer.max_behind_for(media_type);
        })
    }

    fn pipeline(&self, media_type: MediaType) -> Result<&Pipeline> {
        self.pipelines
            .get(&media_type)
            .ok_or_else(|| Error::InvalidConfig(format!("no {media_type} pipeline")))
    }

    fn update_constraints(
        &self,
        media_type: MediaType,
        f: impl FnOnce(&mut QualityConstraints),
    ) -> Result<()> {
        let pipeline = self.pipeline(media_type)?;
        let mut constraints = pipeline.constraints.get();
        f(&mut constraints);
        debug!(media_type = %media_type, ?constraints, "Quality constraints updated");
        pipeline.constraints.set_if_changed(constraints);
        Ok(())
    }

    fn update_goals(
        &self,
        media_type: MediaType,
        f: impl FnOnce(&mut BufferGoals, &AdaptiveConfig),
    ) -> Result<()> {
        let pipeline = self.pipeline(media_type)?;
        let mut goals = pipeline.goals.get();
        f(&mut goals, &self.config);
        debug!(media_type = %media_type, ?goals, "Buffer goals updated");
        pipeline.goals.set_if_changed(goals);
        Ok(())
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOrchestrator")
            .field("media_types", &self.media_types())
            .field("active_period", &self.active_period())
            .finish_non_exhaustive()
    }
}

struct TrackedStream {
    handle: PeriodStreamHandle,
    announced_ready: bool,
}

/// Keeps the period streams of one media type in line with the position
struct TypeLoop {
    ctx: StreamContext,
    manifest: Arc<dyn Manifest>,
    streams: VecDeque<TrackedStream>,
    notify: Arc<Notify>,
    active: Arc<Mutex<ActivePeriodTracker>>,
    completion: Arc<Mutex<CompletionTracker>>,
    cancel: CancellationToken,
    bounds_warning: bool,
}

async fn next_update(
    rx: &mut Option<broadcast::Receiver<DecipherabilityUpdate>>,
) -> Option<DecipherabilityUpdate> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match receiver.recv().await {
            Ok(update) => return Some(update),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed decipherability updates");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    *rx = None;
    None
}

impl TypeLoop {
    #[instrument(skip_all, fields(media_type = %self.ctx.media_type))]
    async fn run(mut self) {
        let mut observation_rx = self.ctx.observation.subscribe();
        let mut decipherability_rx = Some(self.manifest.subscribe_decipherability());
        let notify = Arc::clone(&self.notify);

        loop {
            if let Some(error) = self.failed_stream() {
                self.halt(&error);
                break;
            }
            if let Err(error) = self.evaluate() {
                self.ctx.events.emit(StreamEvent::Error {
                    media_type: self.ctx.media_type,
                    error: error.clone(),
                });
                self.halt(&error);
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                update = next_update(&mut decipherability_rx) => {
                    let Some(update) = update else { continue };
                    if update.media_type != self.ctx.media_type {
                        continue;
                    }
                    if let Err(error) = self.flush_undecipherable(&update).await {
                        self.ctx.events.emit(StreamEvent::Error {
                            media_type: self.ctx.media_type,
                            error: error.clone(),
                        });
                        self.halt(&error);
                        break;
                    }
                }
                _ = notify.notified() => {}
                changed = observation_rx.changed() => if changed.is_err() { break },
            }
        }

        self.clear_from(0);
    }

    fn failed_stream(&self) -> Option<Error> {
        self.streams.iter().find_map(|s| s.handle.state().error)
    }

    fn halt(&mut self, error: &Error) {
        warn!(error = %error, "Stopping pipeline");
        self.clear_from(0);
        self.ctx.sink.dispose();
    }

    fn evaluate(&mut self) -> Result<()> {
        let position = self.ctx.observation.get().position;

        // streams whose period was played entirely
        while self.streams.len() > 1 {
            let finished = self.streams[0]
                .handle
                .period
                .end
                .is_some_and(|end| position >= end);
            if !finished {
                break;
            }
            if let Some(stream) = self.streams.pop_front() {
                self.clear_stream(stream);
            }
        }

        if self.is_out_of_bounds(position) {
            info!(position, "Position out of the loaded periods, restarting");
            self.clear_from(0);
        }

        if self.streams.is_empty() {
            match self.resolve_period(position)? {
                Some(period) => self.start_stream(period),
                None => return Ok(()),
            }
        }

        // start the next period once the last one is complete
        loop {
            let Some(last) = self.streams.back() else {
                break;
            };
            if !last.handle.state().complete {
                break;
            }
            match self.manifest.period_after(&last.handle.period) {
                Some(next) => self.start_stream(next),
                None => break,
            }
        }

        // a period that needs data again invalidates the ones after it
        if let Some(index) = self
            .streams
            .iter()
            .take(self.streams.len().saturating_sub(1))
            .position(|s| !s.handle.state().complete)
        {
            debug!(
                period = %self.streams[index].handle.period.id,
                "Period needs data again, clearing following periods"
            );
            self.clear_from(index + 1);
        }

        self.announce_readiness();
        self.update_completion();
        Ok(())
    }

    fn is_out_of_bounds(&self, position: f64) -> bool {
        let (Some(first), Some(last)) = (self.streams.front(), self.streams.back()) else {
            return false;
        };
        let before = position < first.handle.period.start
            && self.manifest.period_for_time(position).is_some();
        let after = position >= last.handle.period.end_or_infinity()
            && (self.manifest.period_for_time(position).is_some()
                || self.manifest.next_period(position).is_some());
        before || after
    }

    /// Period to start from when nothing is loaded
    fn resolve_period(&mut self, position: f64) -> Result<Option<Arc<Period>>> {
        let minimum = self.manifest.minimum_position();
        let maximum = self.manifest.maximum_position();
        if position < minimum {
            self.warn_bounds(Error::MediaTimeBeforeManifest { position, minimum });
        } else if position > maximum {
            self.warn_bounds(Error::MediaTimeAfterManifest { position, maximum });
        } else {
            self.bounds_warning = false;
        }

        if let Some(period) = self
            .manifest
            .period_for_time(position)
            .or_else(|| self.manifest.next_period(position))
        {
            return Ok(Some(period));
        }
        if position >= maximum {
            return Ok(None);
        }
        Err(Error::MediaTimeNotFound { position })
    }

    fn warn_bounds(&mut self, error: Error) {
        if !self.bounds_warning {
            warn!(error = %error, "Position outside of the manifest");
            self.bounds_warning = true;
            self.ctx.events.warning(error);
        }
    }

    fn start_stream(&mut self, period: Arc<Period>) {
        info!(period = %period.id, start = period.start, "Starting period stream");
        let handle = PeriodStream::spawn(self.ctx.clone(), period, self.cancel.child_token());
        let notify = Arc::clone(&self.notify);
        handle.state_reference().on_update(
            move |_| notify.notify_one(),
            handle.cancellation().clone(),
            false,
        );
        self.streams.push_back(TrackedStream {
            handle,
            announced_ready: false,
        });
        // the stream may have changed state before the callback was registered
        self.notify.notify_one();
    }

    fn clear_stream(&mut self, stream: TrackedStream) {
        let period_id = stream.handle.period.id.clone();
        debug!(period = %period_id, "Clearing period stream");
        stream.handle.clear();
        self.ctx.events.emit(StreamEvent::PeriodStreamCleared {
            media_type: self.ctx.media_type,
            period_id: period_id.clone(),
        });
        if stream.announced_ready {
            let changed = self
                .active
                .lock()
                .mark_cleared(self.ctx.media_type, &period_id);
            if let Some(active) = changed {
                self.ctx
                    .events
                    .emit(StreamEvent::ActivePeriodChanged { period_id: active });
            }
        }
    }

    /// Clear the streams from `index` on, last first
    fn clear_from(&mut self, index: usize) {
        while self.streams.len() > index {
            if let Some(stream) = self.streams.pop_back() {
                self.clear_stream(stream);
            }
        }
    }

    fn announce_readiness(&mut self) {
        let media_type = self.ctx.media_type;
        for stream in self.streams.iter_mut() {
            if stream.announced_ready || !stream.handle.state().ready {
                continue;
            }
            stream.announced_ready = true;
            let period = &stream.handle.period;
            let changed = self
                .active
                .lock()
                .mark_ready(media_type, &period.id, period.start);
            if let Some(active) = changed {
                info!(period = %active, "Active period changed");
                self.ctx
                    .events
                    .emit(StreamEvent::ActivePeriodChanged { period_id: active });
            }
        }
    }

    fn update_completion(&mut self) {
        let complete = self.streams.back().is_some_and(|last| {
            last.handle.state().complete
                && self.manifest.is_last_period_known()
                && self.manifest.period_after(&last.handle.period).is_none()
        });
        let events = self.completion.lock().set(self.ctx.media_type, complete);
        for event in events {
            debug!(event = event.name(), "Completion changed");
            self.ctx.events.emit(event);
        }
    }

    /// Remove data of blacklisted qualities, then restart from scratch
    async fn flush_undecipherable(&mut self, update: &DecipherabilityUpdate) -> Result<()> {
        let affected = self
            .streams
            .iter()
            .any(|s| s.handle.period.id == update.period_id);
        let ranges = self
            .ctx
            .sink
            .inventory()
            .ranges_for_qualities(&update.period_id, &update.quality_ids);
        if !affected && ranges.is_empty() {
            return Ok(());
        }

        info!(
            period = %update.period_id,
            qualities = ?update.quality_ids,
            ranges = ranges.len(),
            "Flushing undecipherable data"
        );
        self.clear_from(0);
        for range in &ranges {
            self.ctx.sink.remove_buffer(range.start, range.end).await?;
        }
        let position = self.ctx.observation.get().position;
        self.ctx
            .events
            .emit(StreamEvent::NeedsDecipherabilityFlush { position });
        Ok(())
    }
}
