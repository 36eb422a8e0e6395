//! Output formatting for CLI

use kino_adaptive::stream::StreamEvent;
use kino_adaptive::MediaType;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// Prints events as they happen, one line each
#[derive(Debug)]
pub struct Printer {
    format: OutputFormat,
}

impl Printer {
    pub fn new(format: &str) -> Self {
        Self {
            format: OutputFormat::from(format),
        }
    }

    pub fn event(&self, time: f64, position: f64, event: &StreamEvent) {
        match self.format {
            OutputFormat::Json => {
                let mut line = json!({
                    "time": round(time),
                    "position": round(position),
                    "event": event.name(),
                });
                if let (Value::Object(line), Value::Object(fields)) = (&mut line, fields(event)) {
                    line.extend(fields);
                }
                println!("{line}");
            }
            OutputFormat::Text => {
                println!(
                    "[{:>8.2}s] pos {:>8.2}  {:<28} {}",
                    time,
                    position,
                    event.name(),
                    describe(event)
                );
            }
        }
    }

    pub fn summary(&self, report: &Report) {
        match self.format {
            OutputFormat::Json => {
                let summary = serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string());
                println!("{summary}");
            }
            OutputFormat::Text => {
                println!("\nSimulation Summary:");
                println!("  Content: {:.1}s", report.duration);
                println!("  Played: {:.1}s", report.played);
                println!("  Wall time (simulated): {:.1}s", report.elapsed);
                println!("  Rebuffering: {:.2}s ({} stalls)", report.stalled, report.stalls);
                println!("  Requests: {}", report.requests);
                println!("  Warnings: {}", report.warnings);
                for (media_type, stats) in &report.media {
                    println!(
                        "  {}: {} switches, average {:.0} bps, last {}",
                        media_type,
                        stats.switches,
                        stats.weighted_average(),
                        stats.last_quality.as_deref().unwrap_or("-"),
                    );
                }
            }
        }
    }
}

fn round(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn fields(event: &StreamEvent) -> Value {
    match event {
        StreamEvent::ActivePeriodChanged { period_id } => json!({ "period": period_id }),
        StreamEvent::PeriodStreamReady { media_type, period_id }
        | StreamEvent::PeriodStreamCleared { media_type, period_id } => {
            json!({ "media_type": media_type, "period": period_id })
        }
        StreamEvent::QualityChanged {
            media_type,
            period_id,
            quality_id,
            bitrate,
        } => json!({
            "media_type": media_type,
            "period": period_id,
            "quality": quality_id,
            "bitrate": bitrate,
        }),
        StreamEvent::BufferComplete(media_type) => json!({ "media_type": media_type }),
        StreamEvent::NeedsDecipherabilityFlush { position } => json!({ "flush_position": position }),
        StreamEvent::Warning(error) => {
            json!({ "code": error.error_code(), "message": error.to_string() })
        }
        StreamEvent::Error { media_type, error } => json!({
            "media_type": media_type,
            "code": error.error_code(),
            "message": error.to_string(),
        }),
        StreamEvent::DiscontinuityEncountered {
            media_type,
            gap_start,
            next,
        } => json!({ "media_type": media_type, "gap_start": gap_start, "next": next }),
        StreamEvent::EstimateChanged {
            media_type,
            estimate,
        } => json!({
            "media_type": media_type,
            "quality": estimate.quality.id,
            "bandwidth": estimate.bitrate,
            "urgent": estimate.urgent,
            "manual": estimate.manual,
            "known_stable_bitrate": estimate.known_stable_bitrate,
        }),
        StreamEvent::NeedsManifestRefresh | StreamEvent::EndOfStream | StreamEvent::ResumeStream => {
            json!({})
        }
    }
}

fn describe(event: &StreamEvent) -> String {
    match event {
        StreamEvent::ActivePeriodChanged { period_id } => period_id.clone(),
        StreamEvent::PeriodStreamReady { media_type, period_id }
        | StreamEvent::PeriodStreamCleared { media_type, period_id } => {
            format!("{media_type} {period_id}")
        }
        StreamEvent::QualityChanged {
            media_type,
            period_id,
            quality_id,
            bitrate,
        } => format!("{media_type} {period_id} {quality_id} ({bitrate} bps)"),
        StreamEvent::BufferComplete(media_type) => media_type.to_string(),
        StreamEvent::NeedsDecipherabilityFlush { position } => format!("seek to {position:.2}"),
        StreamEvent::Warning(error) => format!("{}: {error}", error.error_code()),
        StreamEvent::Error { media_type, error } => {
            format!("{media_type} {}: {error}", error.error_code())
        }
        StreamEvent::DiscontinuityEncountered {
            media_type,
            gap_start,
            next,
        } => format!("{media_type} hole {gap_start:.2} -> {next:.2}"),
        StreamEvent::EstimateChanged {
            media_type,
            estimate,
        } => {
            let bandwidth = estimate
                .bitrate
                .map_or_else(|| "-".to_string(), |b| format!("{b:.0} bps"));
            format!(
                "{media_type} {} bandwidth {bandwidth}{}{}",
                estimate.quality.id,
                if estimate.urgent { " urgent" } else { "" },
                if estimate.manual { " manual" } else { "" },
            )
        }
        StreamEvent::NeedsManifestRefresh | StreamEvent::EndOfStream | StreamEvent::ResumeStream => {
            String::new()
        }
    }
}

/// Per media type statistics
#[derive(Debug, Default, Serialize)]
pub struct MediaStats {
    pub switches: u32,
    pub last_quality: Option<String>,
    #[serde(skip)]
    current_bitrate: u64,
    #[serde(skip)]
    weighted_bitrate: f64,
    #[serde(skip)]
    played: f64,
    average_bitrate: f64,
}

impl MediaStats {
    pub fn weighted_average(&self) -> f64 {
        if self.played > 0.0 {
            self.weighted_bitrate / self.played
        } else {
            0.0
        }
    }
}

/// Outcome of a simulation
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub duration: f64,
    pub played: f64,
    pub elapsed: f64,
    pub stalled: f64,
    pub stalls: u32,
    pub requests: usize,
    pub warnings: u32,
    pub media: BTreeMap<MediaType, MediaStats>,
    #[serde(skip)]
    stalling: bool,
}

impl Report {
    pub fn new(duration: f64) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn record(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::QualityChanged {
                media_type,
                quality_id,
                bitrate,
                ..
            } => {
                let stats = self.media.entry(*media_type).or_default();
                if stats.last_quality.is_some() {
                    stats.switches += 1;
                }
                stats.last_quality = Some(quality_id.clone());
                stats.current_bitrate = *bitrate;
            }
            StreamEvent::Warning(_) => self.warnings += 1,
            _ => {}
        }
    }

    pub fn played(&mut self, seconds: f64) {
        self.played += seconds;
        self.stalling = false;
        for stats in self.media.values_mut() {
            stats.weighted_bitrate += stats.current_bitrate as f64 * seconds;
            stats.played += seconds;
        }
    }

    pub fn stalled(&mut self, seconds: f64) {
        if !self.stalling && self.played > 0.0 {
            self.stalls += 1;
        }
        self.stalling = true;
        self.stalled += seconds;
    }

    pub fn finish(&mut self, elapsed: f64, requests: usize) {
        self.elapsed = elapsed;
        self.requests = requests;
        for stats in self.media.values_mut() {
            stats.average_bitrate = stats.weighted_average();
        }
    }
}
