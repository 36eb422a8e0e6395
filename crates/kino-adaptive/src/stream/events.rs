//! Events emitted by the orchestration layer

use crate::types::{Estimate, MediaType};
use crate::Error;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Orchestration event, delivered in emission order
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The earliest period for which every media type is ready changed
    ActivePeriodChanged { period_id: String },
    /// A period stream pushed its first segment
    PeriodStreamReady {
        media_type: MediaType,
        period_id: String,
    },
    /// A period stream was torn down
    PeriodStreamCleared {
        media_type: MediaType,
        period_id: String,
    },
    /// A period stream switched to another quality
    QualityChanged {
        media_type: MediaType,
        period_id: String,
        quality_id: String,
        bitrate: u64,
    },
    /// Everything up to the end of the content is buffered for a media type
    BufferComplete(MediaType),
    /// Segments needed for the wanted range are not announced yet
    NeedsManifestRefresh,
    /// Undecipherable data was flushed; the host should seek to `position`
    /// to drop decoder state
    NeedsDecipherabilityFlush { position: f64 },
    /// Minor issue that did not interrupt anything
    Warning(Error),
    /// A media type's pipeline stopped on a fatal error
    Error { media_type: MediaType, error: Error },
    /// Every media type is complete
    EndOfStream,
    /// A media type needs data again after end of stream was announced
    ResumeStream,
    /// The position is stuck in a hole; playback should jump to `next`
    DiscontinuityEncountered {
        media_type: MediaType,
        gap_start: f64,
        next: f64,
    },
    /// A new estimate was produced for a media type
    EstimateChanged {
        media_type: MediaType,
        estimate: Arc<Estimate>,
    },
}

impl StreamEvent {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::ActivePeriodChanged { .. } => "active-period-changed",
            StreamEvent::PeriodStreamReady { .. } => "period-stream-ready",
            StreamEvent::PeriodStreamCleared { .. } => "period-stream-cleared",
            StreamEvent::QualityChanged { .. } => "quality-changed",
            StreamEvent::BufferComplete(_) => "buffer-complete",
            StreamEvent::NeedsManifestRefresh => "needs-manifest-refresh",
            StreamEvent::NeedsDecipherabilityFlush { .. } => "needs-decipherability-flush",
            StreamEvent::Warning(_) => "warning",
            StreamEvent::Error { .. } => "error",
            StreamEvent::EndOfStream => "end-of-stream",
            StreamEvent::ResumeStream => "resume-stream",
            StreamEvent::DiscontinuityEncountered { .. } => "discontinuity-encountered",
            StreamEvent::EstimateChanged { .. } => "estimate-changed",
        }
    }
}

/// Sending half of the event channel
///
/// Sending never fails: events emitted after the receiver went away are
/// dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Sender whose events go nowhere
    pub fn disconnected() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }

    pub fn warning(&self, error: Error) {
        self.emit(StreamEvent::Warning(error));
    }
}

/// Create a connected sender/receiver pair
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<StreamEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender::new(tx), rx)
}
