//! Kino Adaptive - Adaptive streaming decision engine for Kino
//!
//! This crate decides what a player should download and when:
//! - Bandwidth estimation from completed and in-flight requests
//! - Quality selection (throughput, buffer level and probing)
//! - Prioritized segment scheduling with retries
//! - Buffer bookkeeping and garbage collection
//! - Period orchestration across media types
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Kino Adaptive                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Manifest   │  │   Playback   │  │   Controls   │          │
//! │  │   (periods)  │  │ observation  │  │  (bitrates)  │          │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │   Stream    │──────► StreamEvent           │
//! │                    │ Orchestrator│                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐           │
//! │  │     ABR      │  │   Period    │  │    Buffer    │           │
//! │  │   Selector   │◄─┤   Streams   ├─►│     Sink     │           │
//! │  └──────────────┘  └──────┬──────┘  └──────────────┘           │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │   Segment   │                              │
//! │                    │  Scheduler  │                              │
//! │                    └─────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod abr;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod ranges;
pub mod reference;
pub mod stream;
pub mod testing;
pub mod types;

pub use abr::{QualityConstraints, QualitySelector};
pub use buffer::{BufferGoals, BufferSink, HostBuffer, HostBufferError};
pub use config::{AbrConfig, AdaptiveConfig, BufferConfig, RequestConfig};
pub use error::{Error, Result};
pub use fetch::{SegmentScheduler, SegmentTransport};
pub use manifest::{DecipherabilityUpdate, Manifest, StaticManifest};
pub use ranges::TimeRange;
pub use reference::SharedReference;
pub use stream::{StreamEvent, StreamOrchestrator};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version
pub fn init() {
    tracing::info!(version = VERSION, "Kino Adaptive initialized");
}
