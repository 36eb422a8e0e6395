//! Content description consumed by the engine
//!
//! Parsing DASH/HLS documents happens elsewhere; the engine only needs to
//! look periods up by time and to hear about decipherability changes.

mod static_manifest;

pub use static_manifest::StaticManifest;

use crate::types::{MediaType, Period};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Qualities that became undecipherable
#[derive(Debug, Clone, PartialEq)]
pub struct DecipherabilityUpdate {
    pub media_type: MediaType,
    pub period_id: String,
    pub quality_ids: Vec<String>,
}

/// Read access to a parsed manifest
pub trait Manifest: Send + Sync {
    /// Period containing `time`
    fn period_for_time(&self, time: f64) -> Option<Arc<Period>>;

    /// Period immediately following `period`
    fn period_after(&self, period: &Period) -> Option<Arc<Period>>;

    /// First period starting after `time`
    fn next_period(&self, time: f64) -> Option<Arc<Period>>;

    /// Content may still grow (live)
    fn is_dynamic(&self) -> bool;

    /// No period will be added after the last one
    fn is_last_period_known(&self) -> bool;

    /// Earliest reachable position
    fn minimum_position(&self) -> f64;

    /// Latest reachable position
    fn maximum_position(&self) -> f64;

    /// Notifications sent whenever the decryption layer blacklists qualities
    fn subscribe_decipherability(&self) -> broadcast::Receiver<DecipherabilityUpdate>;
}
