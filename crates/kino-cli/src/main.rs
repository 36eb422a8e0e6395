//! Kino CLI - Headless simulator for the adaptive streaming engine
//!
//! Features:
//! - Multi-period contents with configurable bitrate ladders
//! - Bandwidth profiles changing over time
//! - Estimate and orchestration event traces (text or JSON)
//! - Rebuffering and quality summary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

/// Kino CLI - Adaptive streaming simulator
#[derive(Parser)]
#[command(name = "kino-cli")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Simulate adaptive streaming decisions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a synthetic content through the engine
    Simulate {
        /// Video bitrates (bps), comma separated
        #[arg(long, value_delimiter = ',', default_value = "400000,1000000,2500000,5000000")]
        video: Vec<u64>,

        /// Audio bitrates (bps), comma separated
        #[arg(long, value_delimiter = ',', default_value = "128000")]
        audio: Vec<u64>,

        /// Bandwidth profile as `time:bps` steps, e.g. `0:3000000,60:800000`
        #[arg(short, long, default_value = "0:3000000")]
        bandwidth: String,

        /// Number of periods the content is split into
        #[arg(short, long, default_value = "1")]
        periods: usize,

        /// Content duration in seconds
        #[arg(short, long, default_value = "120")]
        duration: f64,

        /// Segment duration in seconds
        #[arg(short, long, default_value = "4")]
        segment_duration: f64,

        /// Request latency in milliseconds
        #[arg(long, default_value = "50")]
        latency: u64,

        /// Playback rate
        #[arg(long, default_value = "1.0")]
        speed: f64,

        /// Force a bitrate for video
        #[arg(long)]
        manual_bitrate: Option<u64>,

        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default engine configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
    kino_adaptive::init();

    match cli.command {
        Commands::Simulate {
            video,
            audio,
            bandwidth,
            periods,
            duration,
            segment_duration,
            latency,
            speed,
            manual_bitrate,
            config,
        } => {
            let options = commands::SimulationOptions {
                video,
                audio,
                bandwidth: commands::parse_bandwidth_profile(&bandwidth)?,
                periods,
                duration,
                segment_duration,
                latency_ms: latency,
                speed,
                manual_bitrate,
                config: commands::load_config(config.as_deref())?,
            };
            // paused clock: simulated time jumps to the next timer
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()?;
            runtime.block_on(commands::simulate(options, &cli.format))?;
        }
        Commands::Config => {
            println!("{}", kino_adaptive::AdaptiveConfig::default().to_json());
        }
    }

    Ok(())
}
