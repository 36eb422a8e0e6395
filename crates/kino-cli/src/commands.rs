//! CLI command implementations

use crate::output::{Printer, Report};
use anyhow::{bail, Context};
use kino_adaptive::ranges;
use kino_adaptive::stream::{StreamEvent, StreamOrchestrator};
use kino_adaptive::testing::{ladder_period, MemoryHostBuffer, SimulatedTransport};
use kino_adaptive::{
    AdaptiveConfig, HostBuffer, Manifest, MediaType, PlaybackObservation, SharedReference,
    StaticManifest,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Playback clock resolution
const TICK: Duration = Duration::from_millis(250);

/// Buffer gap under which playback stalls
const STALL_GAP: f64 = 0.05;

/// Parameters of `kino-cli simulate`
#[derive(Debug)]
pub struct SimulationOptions {
    pub video: Vec<u64>,
    pub audio: Vec<u64>,
    /// `(simulated time, bits per second)` steps, sorted by time
    pub bandwidth: Vec<(f64, u64)>,
    pub periods: usize,
    pub duration: f64,
    pub segment_duration: f64,
    pub latency_ms: u64,
    pub speed: f64,
    pub manual_bitrate: Option<u64>,
    pub config: AdaptiveConfig,
}

/// Parse `time:bps` steps such as `0:3000000,60:800000`
pub fn parse_bandwidth_profile(profile: &str) -> anyhow::Result<Vec<(f64, u64)>> {
    let mut steps = Vec::new();
    for step in profile.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (time, bps) = step
            .split_once(':')
            .with_context(|| format!("invalid bandwidth step '{step}', expected time:bps"))?;
        let time: f64 = time
            .trim()
            .parse()
            .with_context(|| format!("invalid time in '{step}'"))?;
        let bps: u64 = bps
            .trim()
            .parse()
            .with_context(|| format!("invalid bandwidth in '{step}'"))?;
        if bps == 0 {
            bail!("bandwidth must be positive in '{step}'");
        }
        steps.push((time, bps));
    }
    if steps.is_empty() {
        bail!("empty bandwidth profile");
    }
    steps.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(steps)
}

/// Read the engine configuration, or use the defaults
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AdaptiveConfig> {
    let Some(path) = path else {
        return Ok(AdaptiveConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = AdaptiveConfig::from_json_str(&json)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn bandwidth_at(profile: &[(f64, u64)], time: f64) -> u64 {
    profile
        .iter()
        .rev()
        .find(|(start, _)| *start <= time)
        .or(profile.first())
        .map_or(1, |(_, bps)| *bps)
}

/// Play a synthetic content through the engine on a simulated clock
pub async fn simulate(options: SimulationOptions, format: &str) -> anyhow::Result<()> {
    if options.video.is_empty() && options.audio.is_empty() {
        bail!("at least one video or audio bitrate is needed");
    }
    if options.periods == 0 || options.duration <= 0.0 || options.segment_duration <= 0.0 {
        bail!("periods, duration and segment duration must be positive");
    }
    if options.speed <= 0.0 {
        bail!("playback rate must be positive");
    }

    let period_length = options.duration / options.periods as f64;
    let periods = (0..options.periods)
        .map(|i| {
            let start = i as f64 * period_length;
            let end = if i + 1 == options.periods {
                options.duration
            } else {
                start + period_length
            };
            ladder_period(
                &format!("p{i}"),
                start,
                end,
                &options.video,
                &options.audio,
                options.segment_duration,
            )
        })
        .collect();
    let manifest: Arc<dyn Manifest> = Arc::new(StaticManifest::new(periods));

    let transport = Arc::new(
        SimulatedTransport::new(bandwidth_at(&options.bandwidth, 0.0))
            .with_latency(Duration::from_millis(options.latency_ms)),
    );

    let mut hosts: Vec<(MediaType, Arc<MemoryHostBuffer>)> = Vec::new();
    if !options.video.is_empty() {
        hosts.push((MediaType::Video, Arc::new(MemoryHostBuffer::new())));
    }
    if !options.audio.is_empty() {
        hosts.push((MediaType::Audio, Arc::new(MemoryHostBuffer::new())));
    }

    let observation = SharedReference::new(PlaybackObservation {
        speed: options.speed,
        duration: Some(options.duration),
        ..PlaybackObservation::at(0.0)
    });
    let (orchestrator, mut events) = StreamOrchestrator::new(
        manifest,
        transport.clone(),
        hosts
            .iter()
            .map(|(t, h)| (*t, h.clone() as Arc<dyn HostBuffer>))
            .collect(),
        options.config.clone(),
        observation.clone(),
    )?;
    if let Some(bitrate) = options.manual_bitrate {
        orchestrator.set_manual_bitrate(MediaType::Video, Some(bitrate))?;
    }

    let printer = Printer::new(format);
    let mut report = Report::new(options.duration);
    info!(
        duration = options.duration,
        periods = options.periods,
        "Starting simulation"
    );
    orchestrator.start();

    let started = Instant::now();
    // generous bound in case the engine stops making progress
    let deadline = options.duration / options.speed * 4.0 + 600.0;
    let mut position = 0.0;
    let mut ticker = tokio::time::interval(TICK);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let elapsed = started.elapsed().as_secs_f64();
                printer.event(elapsed, position, &event);
                report.record(&event);
                match event {
                    StreamEvent::DiscontinuityEncountered { next, .. } => position = next,
                    StreamEvent::NeedsDecipherabilityFlush { position: p } => position = p,
                    StreamEvent::Error { media_type, error } => {
                        bail!("{media_type} pipeline stopped: {error}");
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                let elapsed = started.elapsed().as_secs_f64();
                transport.set_bandwidth(bandwidth_at(&options.bandwidth, elapsed));

                let gap = hosts
                    .iter()
                    .map(|(_, h)| ranges::buffer_gap(&h.buffered_ranges(), position))
                    .fold(f64::INFINITY, f64::min);
                let step = TICK.as_secs_f64() * options.speed;
                if gap > STALL_GAP {
                    let played = step.min(gap);
                    position = (position + played).min(options.duration);
                    report.played(played);
                } else if position < options.duration - STALL_GAP {
                    report.stalled(TICK.as_secs_f64());
                }

                if position >= options.duration - STALL_GAP {
                    break;
                }
                if elapsed > deadline {
                    warn!(position, elapsed, "Simulation deadline reached");
                    break;
                }

                let gap = hosts
                    .iter()
                    .map(|(_, h)| ranges::buffer_gap(&h.buffered_ranges(), position))
                    .fold(f64::INFINITY, f64::min);
                observation.set(
                    PlaybackObservation {
                        speed: options.speed,
                        duration: Some(options.duration),
                        ..PlaybackObservation::at(position)
                    }
                    .with_buffer_gap(gap)
                    .playing(),
                );
            }
        }
    }

    orchestrator.stop().await;
    report.finish(started.elapsed().as_secs_f64(), transport.loads().len());
    printer.summary(&report);
    Ok(())
}
