//! Tracking of the period currently playable for every media type

use crate::types::MediaType;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Decides which period is active: the earliest one whose streams are ready
/// for every tracked media type
#[derive(Debug, Default)]
pub struct ActivePeriodTracker {
    media_types: Vec<MediaType>,
    /// period start (as ordered bits) -> (period id, ready types)
    periods: BTreeMap<u64, (String, HashSet<MediaType>)>,
    starts: HashMap<String, u64>,
    active: Option<String>,
}

fn order_key(start: f64) -> u64 {
    // total order for non-negative starts
    start.max(0.0).to_bits()
}

impl ActivePeriodTracker {
    pub fn new(media_types: &[MediaType]) -> Self {
        Self {
            media_types: media_types.to_vec(),
            ..Default::default()
        }
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// A stream for `media_type` became ready in `period_id`. Returns the new
    /// active period when it changed.
    pub fn mark_ready(&mut self, media_type: MediaType, period_id: &str, start: f64) -> Option<String> {
        let key = order_key(start);
        self.starts.insert(period_id.to_string(), key);
        self.periods
            .entry(key)
            .or_insert_with(|| (period_id.to_string(), HashSet::new()))
            .1
            .insert(media_type);
        self.recompute()
    }

    /// The stream for `media_type` in `period_id` was cleared. Returns the new
    /// active period when it changed to another one.
    pub fn mark_cleared(&mut self, media_type: MediaType, period_id: &str) -> Option<String> {
        if let Some(key) = self.starts.get(period_id).copied() {
            if let Some((_, ready)) = self.periods.get_mut(&key) {
                ready.remove(&media_type);
                if ready.is_empty() {
                    self.periods.remove(&key);
                    self.starts.remove(period_id);
                }
            }
        }
        self.recompute()
    }

    fn recompute(&mut self) -> Option<String> {
        let candidate = self
            .periods
            .values()
            .find(|(_, ready)| self.media_types.iter().all(|t| ready.contains(t)))
            .map(|(id, _)| id.clone());
        match candidate {
            Some(id) if self.active.as_ref() != Some(&id) => {
                self.active = Some(id.clone());
                Some(id)
            }
            // the last active period stays active until another one is ready
            _ => None,
        }
    }
}
