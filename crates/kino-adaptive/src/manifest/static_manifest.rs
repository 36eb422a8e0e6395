//! In-memory manifest

use super::{DecipherabilityUpdate, Manifest};
use crate::types::{Decipherable, MediaType, Period};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Manifest built from already-known periods
#[derive(Debug)]
pub struct StaticManifest {
    periods: Vec<Arc<Period>>,
    dynamic: bool,
    last_period_known: bool,
    decipherability_tx: broadcast::Sender<DecipherabilityUpdate>,
}

impl StaticManifest {
    /// Create a finished (non-dynamic) manifest
    pub fn new(periods: Vec<Period>) -> Self {
        let mut periods: Vec<Arc<Period>> = periods.into_iter().map(Arc::new).collect();
        periods.sort_by(|a, b| a.start.total_cmp(&b.start));
        let (decipherability_tx, _) = broadcast::channel(16);
        Self {
            periods,
            dynamic: false,
            last_period_known: true,
            decipherability_tx,
        }
    }

    /// Mark the content as live, with periods possibly still to come
    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self.last_period_known = false;
        self
    }

    pub fn periods(&self) -> &[Arc<Period>] {
        &self.periods
    }

    /// Flag qualities as undecipherable and notify subscribers
    pub fn blacklist(&self, period_id: &str, media_type: MediaType, quality_ids: &[&str]) {
        let Some(period) = self.periods.iter().find(|p| p.id == period_id) else {
            return;
        };
        let Some(track) = period.track(media_type) else {
            return;
        };
        let mut blacklisted = Vec::new();
        for quality in &track.qualities {
            if quality_ids.contains(&quality.id.as_str()) {
                quality.set_decipherable(Decipherable::No);
                blacklisted.push(quality.id.clone());
            }
        }
        if blacklisted.is_empty() {
            return;
        }
        info!(
            period = period_id,
            media_type = %media_type,
            qualities = ?blacklisted,
            "Qualities blacklisted"
        );
        // No receiver simply means no stream is running
        let _ = self.decipherability_tx.send(DecipherabilityUpdate {
            media_type,
            period_id: period_id.to_string(),
            quality_ids: blacklisted,
        });
    }
}

impl Manifest for StaticManifest {
    fn period_for_time(&self, time: f64) -> Option<Arc<Period>> {
        self.periods.iter().find(|p| p.contains(time)).cloned()
    }

    fn period_after(&self, period: &Period) -> Option<Arc<Period>> {
        let end = period.end?;
        self.periods
            .iter()
            .find(|p| p.start >= end && p.id != period.id)
            .cloned()
    }

    fn next_period(&self, time: f64) -> Option<Arc<Period>> {
        self.periods.iter().find(|p| p.start > time).cloned()
    }

    fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    fn is_last_period_known(&self) -> bool {
        self.last_period_known
    }

    fn minimum_position(&self) -> f64 {
        self.periods.first().map(|p| p.start).unwrap_or(0.0)
    }

    fn maximum_position(&self) -> f64 {
        self.periods
            .iter()
            .filter_map(|p| {
                p.end.or_else(|| {
                    p.tracks
                        .values()
                        .flat_map(|t| t.qualities.iter())
                        .filter_map(|q| q.index.last_position())
                        .reduce(f64::max)
                })
            })
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    fn subscribe_decipherability(&self) -> broadcast::Receiver<DecipherabilityUpdate> {
        self.decipherability_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quality, SegmentIndex, Track};

    fn two_periods() -> StaticManifest {
        let video = |id: &str| {
            Track::new(
                "video",
                MediaType::Video,
                vec![Quality::new(id, 1_000_000, SegmentIndex::uniform(0.0, 2.0, 5, true))],
            )
        };
        StaticManifest::new(vec![
            Period::new("p2", 10.0, Some(20.0)).with_track(video("b")),
            Period::new("p1", 0.0, Some(10.0)).with_track(video("a")),
        ])
    }

    #[test]
    fn test_period_lookup() {
        let manifest = two_periods();
        assert_eq!(manifest.period_for_time(3.0).unwrap().id, "p1");
        assert_eq!(manifest.period_for_time(10.0).unwrap().id, "p2");
        assert!(manifest.period_for_time(25.0).is_none());
        let first = manifest.period_for_time(0.0).unwrap();
        assert_eq!(manifest.period_after(&first).unwrap().id, "p2");
        assert_eq!(manifest.next_period(-1.0).unwrap().id, "p1");
        assert_eq!(manifest.maximum_position(), 20.0);
    }

    #[tokio::test]
    async fn test_blacklist_notifies() {
        let manifest = two_periods();
        let mut rx = manifest.subscribe_decipherability();
        manifest.blacklist("p1", MediaType::Video, &["a"]);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.quality_ids, vec!["a".to_string()]);
        let period = manifest.period_for_time(1.0).unwrap();
        assert!(!period.track(MediaType::Video).unwrap().qualities[0].is_playable());
    }
}
