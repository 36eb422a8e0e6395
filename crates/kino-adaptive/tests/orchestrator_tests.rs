//! End-to-end orchestration scenarios over the simulated transport

use kino_adaptive::stream::{StreamEvent, StreamOrchestrator};
use kino_adaptive::testing::{ladder_period, HostCall, MemoryHostBuffer, SimulatedTransport};
use kino_adaptive::{
    AdaptiveConfig, Error, HostBuffer, Manifest, MediaType, Period, PlaybackObservation,
    SharedReference, StaticManifest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

fn tracing_setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Setup {
    orchestrator: StreamOrchestrator,
    events: UnboundedReceiver<StreamEvent>,
    manifest: Arc<StaticManifest>,
    transport: Arc<SimulatedTransport>,
    hosts: Vec<(MediaType, Arc<MemoryHostBuffer>)>,
    observation: SharedReference<PlaybackObservation>,
}

impl Setup {
    fn new(periods: Vec<Period>, media_types: &[MediaType], position: f64) -> Self {
        tracing_setup();
        let manifest = Arc::new(StaticManifest::new(periods));
        let transport = Arc::new(SimulatedTransport::new(10_000_000));
        let hosts: Vec<(MediaType, Arc<MemoryHostBuffer>)> = media_types
            .iter()
            .map(|&t| (t, Arc::new(MemoryHostBuffer::new())))
            .collect();
        let observation = SharedReference::new(PlaybackObservation::at(position));
        let (orchestrator, events) = StreamOrchestrator::new(
            manifest.clone() as Arc<dyn Manifest>,
            transport.clone(),
            hosts
                .iter()
                .map(|(t, h)| (*t, h.clone() as Arc<dyn HostBuffer>))
                .collect(),
            AdaptiveConfig::default(),
            observation.clone(),
        )
        .unwrap();
        Self {
            orchestrator,
            events,
            manifest,
            transport,
            hosts,
            observation,
        }
    }

    fn host(&self, media_type: MediaType) -> Arc<MemoryHostBuffer> {
        self.hosts
            .iter()
            .find(|(t, _)| *t == media_type)
            .map(|(_, h)| h.clone())
            .unwrap()
    }

    /// Collect events until one matches `until`, failing after a minute of
    /// simulated time
    async fn collect_until(&mut self, until: impl Fn(&StreamEvent) -> bool) -> Vec<StreamEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out, events so far: {seen:?}"))
                .unwrap();
            let done = until(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn drain(&mut self) -> Vec<StreamEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

fn position_of(events: &[StreamEvent], f: impl Fn(&StreamEvent) -> bool) -> Option<usize> {
    events.iter().position(f)
}

#[tokio::test(start_paused = true)]
async fn test_chains_periods_until_end_of_stream() {
    let mut setup = Setup::new(
        vec![
            ladder_period("p0", 0.0, 8.0, &[1_000_000], &[], 4.0),
            ladder_period("p1", 8.0, 16.0, &[1_000_000], &[], 4.0),
        ],
        &[MediaType::Video],
        0.0,
    );
    setup.orchestrator.start();

    let events = setup
        .collect_until(|e| matches!(e, StreamEvent::EndOfStream))
        .await;

    let ready = |id: &'static str| {
        move |e: &StreamEvent| matches!(e, StreamEvent::PeriodStreamReady { period_id, .. } if period_id == id)
    };
    let p0_ready = position_of(&events, ready("p0")).unwrap();
    let p1_ready = position_of(&events, ready("p1")).unwrap();
    assert!(p0_ready < p1_ready);

    let active = position_of(&events, |e| {
        matches!(e, StreamEvent::ActivePeriodChanged { period_id } if period_id == "p0")
    })
    .unwrap();
    assert!(active > p0_ready);
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::BufferComplete(MediaType::Video))));
    assert_eq!(setup.orchestrator.active_period().as_deref(), Some("p0"));

    let periods: Vec<String> = setup
        .transport
        .loads()
        .iter()
        .filter(|l| l.segment.is_some())
        .map(|l| l.period_id.clone())
        .collect();
    assert_eq!(periods, vec!["p0", "p0", "p1", "p1"]);

    let buffered = setup.host(MediaType::Video).buffered_ranges();
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].start, 0.0);
    assert_eq!(buffered[0].end, 16.0);

    setup.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_active_period_waits_for_every_type() {
    let mut setup = Setup::new(
        vec![ladder_period("p0", 0.0, 8.0, &[1_000_000], &[128_000], 4.0)],
        &[MediaType::Video, MediaType::Audio],
        0.0,
    );
    setup.orchestrator.start();

    let events = setup
        .collect_until(|e| matches!(e, StreamEvent::ActivePeriodChanged { .. }))
        .await;
    let ready: Vec<MediaType> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::PeriodStreamReady { media_type, .. } => Some(*media_type),
            _ => None,
        })
        .collect();
    assert_eq!(ready.len(), 2);
    assert!(ready.contains(&MediaType::Video));
    assert!(ready.contains(&MediaType::Audio));

    let events = setup
        .collect_until(|e| matches!(e, StreamEvent::EndOfStream))
        .await;
    let complete = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::BufferComplete(_)))
        .count();
    // one of the two may have completed before the active period changed
    assert!(complete >= 1);

    let audio_inits = setup
        .host(MediaType::Audio)
        .calls()
        .iter()
        .filter(|c| matches!(c, HostCall::Append { init: true, .. }))
        .count();
    assert_eq!(audio_inits, 1);
    setup.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_seek_outside_loaded_periods_restarts() {
    let mut setup = Setup::new(
        vec![
            ladder_period("p0", 0.0, 20.0, &[1_000_000], &[], 4.0),
            ladder_period("p1", 20.0, 40.0, &[1_000_000], &[], 4.0),
        ],
        &[MediaType::Video],
        0.0,
    );
    setup
        .orchestrator
        .set_wanted_buffer_ahead(MediaType::Video, 5.0)
        .unwrap();
    setup.orchestrator.start();
    setup
        .collect_until(|e| matches!(e, StreamEvent::ActivePeriodChanged { .. }))
        .await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    setup.drain();

    setup.observation.set(PlaybackObservation::at(30.0));
    let events = setup
        .collect_until(|e| {
            matches!(e, StreamEvent::ActivePeriodChanged { period_id } if period_id == "p1")
        })
        .await;

    let cleared = position_of(&events, |e| {
        matches!(e, StreamEvent::PeriodStreamCleared { period_id, .. } if period_id == "p0")
    })
    .unwrap();
    let ready = position_of(&events, |e| {
        matches!(e, StreamEvent::PeriodStreamReady { period_id, .. } if period_id == "p1")
    })
    .unwrap();
    assert!(cleared < ready);

    let p1_segments: Vec<u64> = setup
        .transport
        .loads()
        .iter()
        .filter(|l| l.period_id == "p1")
        .filter_map(|l| l.segment)
        .collect();
    // starts from the segment containing the new position
    assert_eq!(p1_segments.first(), Some(&3));
    setup.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_position_before_manifest_warns_once() {
    let mut setup = Setup::new(
        vec![ladder_period("p0", 10.0, 20.0, &[1_000_000], &[], 4.0)],
        &[MediaType::Video],
        0.0,
    );
    setup.orchestrator.start();

    let events = setup
        .collect_until(|e| matches!(e, StreamEvent::EndOfStream))
        .await;
    let warnings = events
        .iter()
        .filter(|e| {
            matches!(
                e,
                StreamEvent::Warning(Error::MediaTimeBeforeManifest { minimum, .. }) if *minimum == 10.0
            )
        })
        .count();
    assert_eq!(warnings, 1);
    assert!(events.iter().any(
        |e| matches!(e, StreamEvent::PeriodStreamReady { period_id, .. } if period_id == "p0")
    ));
    setup.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_undecipherable_quality_is_flushed() {
    let mut setup = Setup::new(
        vec![ladder_period("p0", 0.0, 20.0, &[1_000_000, 2_000_000], &[], 4.0)],
        &[MediaType::Video],
        0.0,
    );
    setup
        .orchestrator
        .set_manual_bitrate(MediaType::Video, Some(2_000_000))
        .unwrap();
    setup.orchestrator.start();
    setup
        .collect_until(|e| matches!(e, StreamEvent::EndOfStream))
        .await;

    setup
        .manifest
        .blacklist("p0", MediaType::Video, &["video-2000000"]);
    let events = setup
        .collect_until(|e| matches!(e, StreamEvent::NeedsDecipherabilityFlush { .. }))
        .await;
    assert!(matches!(
        events.last(),
        Some(StreamEvent::NeedsDecipherabilityFlush { position }) if *position == 0.0
    ));
    assert!(setup
        .host(MediaType::Video)
        .calls()
        .iter()
        .any(|c| matches!(c, HostCall::Remove { .. })));

    // reloaded with what is left
    setup
        .collect_until(|e| matches!(e, StreamEvent::PeriodStreamReady { .. }))
        .await;
    let last = setup.transport.loads().last().cloned().unwrap();
    assert_eq!(last.quality_id, "video-1000000");
    setup.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_host_failure_halts_media_type() {
    let mut setup = Setup::new(
        vec![ladder_period("p0", 0.0, 20.0, &[1_000_000], &[], 4.0)],
        &[MediaType::Video],
        0.0,
    );
    setup.host(MediaType::Video).fail_next_append("decode error");
    setup.orchestrator.start();

    let events = setup
        .collect_until(|e| matches!(e, StreamEvent::Error { .. }))
        .await;
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error {
            media_type: MediaType::Video,
            error: Error::BufferAppend { .. }
        })
    ));

    tokio::time::sleep(Duration::from_secs(10)).await;
    let errors = setup
        .drain()
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error { .. }))
        .count();
    assert_eq!(errors, 0);
    assert!(setup.orchestrator.sink(MediaType::Video).unwrap().is_disposed());
    setup.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_estimates_are_forwarded() {
    let mut setup = Setup::new(
        vec![ladder_period("p0", 0.0, 8.0, &[1_000_000], &[], 4.0)],
        &[MediaType::Video],
        0.0,
    );
    let mut estimates = setup
        .orchestrator
        .subscribe_estimates(MediaType::Video)
        .unwrap();
    setup.orchestrator.start();

    let events = setup
        .collect_until(|e| matches!(e, StreamEvent::EstimateChanged { .. }))
        .await;
    let Some(StreamEvent::EstimateChanged { media_type, estimate }) = events.last() else {
        panic!("no estimate");
    };
    assert_eq!(*media_type, MediaType::Video);
    assert_eq!(estimate.quality.id, "video-1000000");

    estimates.changed().await.unwrap();
    assert!(estimates.borrow().is_some());
    assert!(setup.orchestrator.estimate(MediaType::Video).is_some());
    setup.orchestrator.stop().await;
}

#[tokio::test]
async fn test_controls_reject_unknown_media_type() {
    let setup = Setup::new(
        vec![ladder_period("p0", 0.0, 8.0, &[1_000_000], &[], 4.0)],
        &[MediaType::Video],
        0.0,
    );
    let err = setup
        .orchestrator
        .set_manual_bitrate(MediaType::Audio, Some(1))
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_CONFIG");
    assert!(setup
        .orchestrator
        .set_wanted_buffer_ahead(MediaType::Video, 0.0)
        .is_err());
    assert!(setup
        .orchestrator
        .set_max_buffer_behind(MediaType::Video, Some(30.0))
        .is_ok());
}
