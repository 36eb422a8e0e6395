//! Host buffer access
//!
//! One [`BufferSink`] per media type serializes every operation on the host
//! buffer, keeps an inventory of what was pushed and periodically removes
//! data the [`GarbageCollector`] considers too far from the position.

pub mod gc;
pub mod inventory;
pub mod sink;

pub use gc::GarbageCollector;
pub use inventory::{BufferInventory, BufferedChunk};
pub use sink::{BufferSink, ChunkInfo};

use crate::config::BufferConfig;
use crate::ranges::TimeRange;
use crate::types::MediaType;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Rejection reported by the host buffer
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HostBufferError {
    pub message: String,
}

impl HostBufferError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The media engine's buffer for one media type
#[async_trait]
pub trait HostBuffer: Send + Sync {
    /// Append data. `range` is the time range the data is expected to cover,
    /// `None` for initialization segments.
    async fn append(&self, data: Bytes, range: Option<TimeRange>) -> Result<(), HostBufferError>;

    /// Remove `[start, end)`
    async fn remove(&self, start: f64, end: f64) -> Result<(), HostBufferError>;

    /// Ranges currently buffered
    fn buffered_ranges(&self) -> Vec<TimeRange>;
}

/// How much data to keep around the position for one media type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferGoals {
    /// Loading stops once this much is buffered ahead
    pub wanted_ahead: f64,
    /// Data further ahead is collected
    pub max_ahead: f64,
    /// Data further behind is collected
    pub max_behind: f64,
}

impl BufferGoals {
    pub fn from_config(config: &BufferConfig, media_type: MediaType) -> Self {
        Self {
            wanted_ahead: config.wanted_buffer_ahead,
            max_ahead: config.max_ahead_for(media_type),
            max_behind: config.max_behind_for(media_type),
        }
    }

    /// Seconds to load ahead of the position, never more than what would be
    /// collected right away
    pub fn effective_ahead(&self) -> f64 {
        self.wanted_ahead.min(self.max_ahead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LIGHTWEIGHT_BUFFER_CAP;

    #[test]
    fn test_goals_for_lightweight_types() {
        let config = BufferConfig {
            max_buffer_behind: Some(60.0),
            ..BufferConfig::default()
        };
        let text = BufferGoals::from_config(&config, MediaType::Text);
        assert_eq!(text.max_ahead, LIGHTWEIGHT_BUFFER_CAP);
        assert_eq!(text.max_behind, 60.0);

        let video = BufferGoals {
            max_ahead: 12.0,
            ..BufferGoals::from_config(&config, MediaType::Video)
        };
        assert_eq!(video.effective_ahead(), 12.0);
    }
}
