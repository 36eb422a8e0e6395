//! Integration tests for Kino Adaptive

use bytes::Bytes;
use kino_adaptive::abr::{AbrState, QualityConstraints, QualitySelector};
use kino_adaptive::buffer::{BufferSink, ChunkInfo};
use kino_adaptive::fetch::{RequestPrioritizer, SegmentRequest, SegmentScheduler, SegmentTransport};
use kino_adaptive::stream::{events, StreamEvent};
use kino_adaptive::testing::{ladder_period, HostCall, MemoryHostBuffer, SimulatedTransport};
use kino_adaptive::{
    AdaptiveConfig, Error, MediaType, PlaybackObservation, RequestConfig, TimeRange,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Quality selection
// =============================================================================

fn selector(media_type: MediaType) -> QualitySelector {
    let config = AdaptiveConfig::default();
    QualitySelector::new(media_type, &config.abr, Arc::new(AbrState::new(&config.abr)))
}

#[test]
fn test_single_quality_is_urgent_and_automatic() {
    let period = ladder_period("p0", 0.0, 60.0, &[], &[128_000], 4.0);
    let qualities = period.track(MediaType::Audio).unwrap().playable_qualities();
    let mut selector = selector(MediaType::Audio);

    let constraints = QualityConstraints {
        manual_bitrate: Some(10_000_000),
        ..Default::default()
    };
    for position in [0.0, 12.0, 40.0] {
        let estimate = selector
            .estimate(
                &qualities,
                &PlaybackObservation::at(position),
                qualities.first(),
                &constraints,
                Instant::now(),
            )
            .unwrap();
        assert_eq!(estimate.quality.id, "audio-128000");
        assert!(estimate.urgent);
        assert!(!estimate.manual);
        assert_eq!(estimate.bitrate, None);
    }
}

#[test]
fn test_manual_bitrate_picks_best_fit() {
    let period = ladder_period("p0", 0.0, 60.0, &[500_000, 1_000_000, 2_000_000], &[], 4.0);
    let qualities = period.track(MediaType::Video).unwrap().playable_qualities();
    let mut selector = selector(MediaType::Video);

    let constraints = QualityConstraints {
        manual_bitrate: Some(1_500_000),
        ..Default::default()
    };
    let estimate = selector
        .estimate(
            &qualities,
            &PlaybackObservation::at(0.0),
            None,
            &constraints,
            Instant::now(),
        )
        .unwrap();
    assert_eq!(estimate.quality.bitrate, 1_000_000);
    assert!(estimate.manual);
    assert!(estimate.urgent);

    // below the lowest quality
    let constraints = QualityConstraints {
        manual_bitrate: Some(100),
        ..Default::default()
    };
    let estimate = selector
        .estimate(
            &qualities,
            &PlaybackObservation::at(0.0),
            None,
            &constraints,
            Instant::now(),
        )
        .unwrap();
    assert_eq!(estimate.quality.bitrate, 500_000);
}

#[test]
fn test_no_playable_quality() {
    let mut selector = selector(MediaType::Video);
    let err = selector
        .estimate(
            &[],
            &PlaybackObservation::at(0.0),
            None,
            &QualityConstraints::default(),
            Instant::now(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NoPlayableQuality(MediaType::Video)));
}

// =============================================================================
// Buffer sink
// =============================================================================

#[tokio::test]
async fn test_sink_pushes_init_once_per_quality() {
    let host = Arc::new(MemoryHostBuffer::new());
    let sink = BufferSink::new(MediaType::Video, host.clone(), 0.05);
    let period = ladder_period("p0", 0.0, 12.0, &[1_000_000], &[], 4.0);
    let quality = Arc::clone(&period.track(MediaType::Video).unwrap().qualities[0]);
    let init = Bytes::from_static(b"init");

    for segment in &quality.index.segments[..2] {
        let info = ChunkInfo {
            period_id: "p0".into(),
            quality: Arc::clone(&quality),
            segment: segment.clone(),
        };
        sink.push_chunk(Bytes::from_static(b"media"), Some(init.clone()), info.clone())
            .await
            .unwrap();
        sink.end_of_segment(info).await.unwrap();
    }

    let calls = host.calls();
    assert_eq!(
        calls,
        vec![
            HostCall::Append {
                init: true,
                range: None
            },
            HostCall::Append {
                init: false,
                range: Some(TimeRange::new(0.0, 4.0))
            },
            HostCall::Append {
                init: false,
                range: Some(TimeRange::new(4.0, 8.0))
            },
        ]
    );
    let inventory = sink.inventory();
    assert_eq!(inventory.chunks().len(), 2);
    assert!(inventory.chunks().iter().all(|c| c.complete));
}

#[tokio::test]
async fn test_disposed_sink_rejects_operations() {
    let host = Arc::new(MemoryHostBuffer::new());
    let sink = BufferSink::new(MediaType::Audio, host.clone(), 0.05);
    sink.dispose();
    let err = sink.remove_buffer(0.0, 10.0).await.unwrap_err();
    assert!(matches!(err, Error::BufferDisposed { media_type: MediaType::Audio }));
    assert!(host.calls().is_empty());
}

// =============================================================================
// Segment fetching
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduler_reports_bandwidth() {
    let config = AdaptiveConfig::default();
    let transport = Arc::new(SimulatedTransport::new(4_000_000));
    let abr = Arc::new(AbrState::new(&config.abr));
    let (events, _rx) = events::channel();
    let scheduler = SegmentScheduler::new(
        MediaType::Video,
        transport.clone() as Arc<dyn SegmentTransport>,
        Arc::clone(&abr),
        RequestConfig::default(),
        false,
        events,
    );

    let period = ladder_period("p0", 0.0, 40.0, &[2_000_000], &[], 4.0);
    let quality = Arc::clone(&period.track(MediaType::Video).unwrap().qualities[0]);
    for segment in &quality.index.segments[..3] {
        let request = SegmentRequest {
            media_type: MediaType::Video,
            period_id: "p0".into(),
            quality: Arc::clone(&quality),
            segment: segment.clone(),
        };
        let task = scheduler.task(scheduler.priority_for(segment.time, 0.0));
        let loaded = scheduler
            .fetch(request, task, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loaded.size, 1_000_000);
    }

    let estimate = abr.throughput.lock().estimate().unwrap();
    assert!((estimate - 4_000_000.0).abs() < 1.0, "estimate {estimate}");
    assert_eq!(transport.loads().len(), 3);
    assert!(abr.pending.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_retries_offline_failures() {
    let config = AdaptiveConfig::default();
    let transport = Arc::new(SimulatedTransport::new(4_000_000));
    transport.fail_next(Error::SegmentOffline { url: "v1".into() });
    transport.fail_next(Error::SegmentOffline { url: "v1".into() });
    let abr = Arc::new(AbrState::new(&config.abr));
    let (events, mut rx) = events::channel();
    let scheduler = SegmentScheduler::new(
        MediaType::Video,
        transport.clone() as Arc<dyn SegmentTransport>,
        Arc::clone(&abr),
        RequestConfig::default(),
        false,
        events,
    );

    let period = ladder_period("p0", 0.0, 40.0, &[2_000_000], &[], 4.0);
    let quality = Arc::clone(&period.track(MediaType::Video).unwrap().qualities[0]);
    let segment = quality.index.segments[0].clone();
    let request = SegmentRequest {
        media_type: MediaType::Video,
        period_id: "p0".into(),
        quality,
        segment,
    };
    let loaded = scheduler
        .fetch(request, scheduler.task(0), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(loaded.size, 1_000_000);

    let loads = transport.loads();
    assert_eq!(loads.len(), 3);
    assert!(loads.iter().all(|l| l.segment == Some(1)));

    let mut warnings = 0;
    while let Ok(event) = rx.try_recv() {
        assert!(matches!(event, StreamEvent::Warning(Error::SegmentOffline { .. })));
        warnings += 1;
    }
    assert_eq!(warnings, 2);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_task_interrupts_low_priority_one() {
    let prioritizer = RequestPrioritizer::new(1, 3);
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let low = prioritizer.task(5);
    let low_log = Arc::clone(&log);
    let low_run = tokio::spawn(async move {
        let mut attempts = 0;
        low.run(
            move |token: CancellationToken| {
                attempts += 1;
                let log = Arc::clone(&low_log);
                let attempt = attempts;
                async move {
                    log.lock().push(format!("low start {attempt}"));
                    tokio::select! {
                        _ = token.cancelled() => Err(Error::Cancelled),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {
                            log.lock().push(format!("low done {attempt}"));
                            Ok(())
                        }
                    }
                }
            },
            &CancellationToken::new(),
        )
        .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let high = prioritizer.task(1);
    let high_log = Arc::clone(&log);
    high.run(
        move |_token: CancellationToken| {
            let log = Arc::clone(&high_log);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                log.lock().push("high done".to_string());
                Ok::<(), Error>(())
            }
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    low_run.await.unwrap().unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            "low start 1".to_string(),
            "high done".to_string(),
            "low start 2".to_string(),
            "low done 2".to_string(),
        ]
    );
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_round_trip_through_json() {
    let mut config = AdaptiveConfig::default();
    config.buffer.wanted_buffer_ahead = 45.0;
    config.abr.low_latency = true;
    let parsed = AdaptiveConfig::from_json_str(&config.to_json()).unwrap();
    assert_eq!(parsed, config);
}
