//! Serialized access to one host buffer
//!
//! Every push, removal and end-of-segment marker goes through a FIFO drained
//! by a single worker task, one operation at a time. Each caller gets the
//! result of its own operation only.

use super::gc::GarbageCollector;
use super::inventory::{BufferInventory, BufferedChunk};
use super::{BufferGoals, HostBuffer, HostBufferError};
use crate::ranges::TimeRange;
use crate::reference::SharedReference;
use crate::types::{MediaType, PlaybackObservation, Quality, Segment};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// What a pushed chunk is
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    pub period_id: String,
    pub quality: Arc<Quality>,
    pub segment: Segment,
}

#[derive(Debug)]
enum SinkOperation {
    Push {
        data: Bytes,
        init: Option<Bytes>,
        info: ChunkInfo,
    },
    Remove {
        start: f64,
        end: f64,
    },
    EndOfSegment {
        info: ChunkInfo,
    },
}

impl SinkOperation {
    fn name(&self) -> &'static str {
        match self {
            SinkOperation::Push { .. } => "push",
            SinkOperation::Remove { .. } => "remove",
            SinkOperation::EndOfSegment { .. } => "end-of-segment",
        }
    }
}

struct QueuedOperation {
    operation: SinkOperation,
    done: oneshot::Sender<Result<()>>,
}

/// Queue in front of a [`HostBuffer`]
pub struct BufferSink {
    media_type: MediaType,
    host: Arc<dyn HostBuffer>,
    inventory: Arc<Mutex<BufferInventory>>,
    tx: mpsc::UnboundedSender<QueuedOperation>,
    disposed: CancellationToken,
    tolerance: f64,
}

impl BufferSink {
    /// Create the sink and start its worker on the current runtime
    pub fn new(media_type: MediaType, host: Arc<dyn HostBuffer>, tolerance: f64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inventory = Arc::new(Mutex::new(BufferInventory::new()));
        let disposed = CancellationToken::new();

        let worker = SinkWorker {
            media_type,
            host: Arc::clone(&host),
            inventory: Arc::clone(&inventory),
            disposed: disposed.clone(),
            last_init: None,
            tolerance,
        };
        tokio::spawn(worker.run(rx));

        Self {
            media_type,
            host,
            inventory,
            tx,
            disposed,
            tolerance,
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Push a media chunk, preceded by `init` when it differs from the last
    /// initialization segment pushed
    pub async fn push_chunk(&self, data: Bytes, init: Option<Bytes>, info: ChunkInfo) -> Result<()> {
        self.enqueue(SinkOperation::Push { data, init, info }).await
    }

    /// Remove `[start, end)` from the host buffer
    pub async fn remove_buffer(&self, start: f64, end: f64) -> Result<()> {
        self.enqueue(SinkOperation::Remove { start, end }).await
    }

    /// Mark the chunk described by `info` as entirely pushed
    pub async fn end_of_segment(&self, info: ChunkInfo) -> Result<()> {
        self.enqueue(SinkOperation::EndOfSegment { info }).await
    }

    async fn enqueue(&self, operation: SinkOperation) -> Result<()> {
        let disposed = Error::BufferDisposed {
            media_type: self.media_type,
        };
        if self.disposed.is_cancelled() {
            return Err(disposed);
        }
        let (done, result) = oneshot::channel();
        self.tx
            .send(QueuedOperation { operation, done })
            .map_err(|_| disposed.clone())?;
        result.await.unwrap_or(Err(disposed))
    }

    /// Stop the worker; queued and future operations fail
    pub fn dispose(&self) {
        if !self.disposed.is_cancelled() {
            debug!(media_type = %self.media_type, "Disposing buffer sink");
            self.disposed.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Ranges currently buffered by the host
    pub fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.host.buffered_ranges()
    }

    /// Inventory aligned on the host's buffered ranges
    pub fn inventory(&self) -> BufferInventory {
        let ranges = self.host.buffered_ranges();
        let mut inventory = self.inventory.lock();
        inventory.synchronize(&ranges, self.tolerance);
        inventory.clone()
    }

    /// Remove what `gc` considers too far from `position`
    #[instrument(skip(self, gc), fields(media_type = %self.media_type))]
    pub async fn collect_garbage(&self, position: f64, gc: &GarbageCollector) -> Result<()> {
        if gc.is_disabled() {
            return Ok(());
        }
        let playing = self.inventory().chunk_at(position).map(BufferedChunk::range);
        for range in gc.plan(&self.buffered_ranges(), position, playing) {
            debug!(start = range.start, end = range.end, "Collecting buffered range");
            self.remove_buffer(range.start, range.end).await?;
        }
        Ok(())
    }

    /// Run garbage collection every `interval` against the latest position
    /// and buffer goals, until `cancel` is cancelled or the sink is disposed
    pub fn spawn_garbage_collection(
        self: &Arc<Self>,
        observation: SharedReference<PlaybackObservation>,
        goals: SharedReference<BufferGoals>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sink.disposed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let goals = goals.get();
                let gc = GarbageCollector::new(goals.max_behind, goals.max_ahead);
                let position = observation.get().position;
                if let Err(e) = sink.collect_garbage(position, &gc).await {
                    warn!(media_type = %sink.media_type, error = %e, "Garbage collection failed");
                }
            }
        })
    }
}

impl Drop for BufferSink {
    fn drop(&mut self) {
        self.disposed.cancel();
    }
}

impl std::fmt::Debug for BufferSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSink")
            .field("media_type", &self.media_type)
            .field("disposed", &self.disposed.is_cancelled())
            .finish_non_exhaustive()
    }
}

struct SinkWorker {
    media_type: MediaType,
    host: Arc<dyn HostBuffer>,
    inventory: Arc<Mutex<BufferInventory>>,
    disposed: CancellationToken,
    last_init: Option<Bytes>,
    tolerance: f64,
}

impl SinkWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<QueuedOperation>) {
        let disposed = self.disposed.clone();
        let media_type = self.media_type;
        loop {
            let queued = tokio::select! {
                biased;
                _ = disposed.cancelled() => break,
                queued = rx.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };
            let name = queued.operation.name();
            let result = tokio::select! {
                biased;
                _ = disposed.cancelled() => Err(Error::BufferDisposed { media_type }),
                result = self.process(queued.operation) => result,
            };
            if let Err(e) = &result {
                warn!(media_type = %self.media_type, operation = name, error = %e, "Buffer operation failed");
                self.last_init = None;
            }
            let _ = queued.done.send(result);
        }

        rx.close();
        while let Some(queued) = rx.recv().await {
            let _ = queued.done.send(Err(Error::BufferDisposed { media_type }));
        }
    }

    fn append_error(&self, error: HostBufferError) -> Error {
        Error::BufferAppend {
            media_type: self.media_type,
            message: error.to_string(),
        }
    }

    async fn process(&mut self, operation: SinkOperation) -> Result<()> {
        match operation {
            SinkOperation::Push { data, init, info } => {
                if let Some(init) = init {
                    if self.last_init.as_ref() != Some(&init) {
                        debug!(
                            media_type = %self.media_type,
                            quality = %info.quality.id,
                            "Pushing initialization segment"
                        );
                        self.last_init = None;
                        self.host
                            .append(init.clone(), None)
                            .await
                            .map_err(|e| self.append_error(e))?;
                        self.last_init = Some(init);
                    }
                }
                let range = TimeRange::new(info.segment.time, info.segment.end());
                self.host
                    .append(data, Some(range))
                    .await
                    .map_err(|e| self.append_error(e))?;
                self.inventory.lock().insert(BufferedChunk {
                    period_id: info.period_id,
                    quality: info.quality,
                    start: range.start,
                    end: range.end,
                    complete: false,
                });
                Ok(())
            }
            SinkOperation::Remove { start, end } => {
                self.host
                    .remove(start, end)
                    .await
                    .map_err(|e| Error::BufferRemove {
                        media_type: self.media_type,
                        start,
                        end,
                        message: e.to_string(),
                    })?;
                self.inventory.lock().remove(start, end);
                Ok(())
            }
            SinkOperation::EndOfSegment { info } => {
                self.inventory
                    .lock()
                    .complete(&info.quality.id, info.segment.time, self.tolerance);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostCall, MemoryHostBuffer};
    use crate::types::SegmentIndex;

    fn info(number: u64) -> ChunkInfo {
        ChunkInfo {
            period_id: "p0".into(),
            quality: Arc::new(Quality::new("v1", 1_000_000, SegmentIndex::default())),
            segment: Segment::media(number, (number - 1) as f64 * 4.0, 4.0),
        }
    }

    #[tokio::test]
    async fn test_same_init_is_pushed_once() {
        let host = Arc::new(MemoryHostBuffer::new());
        let sink = BufferSink::new(MediaType::Video, host.clone(), 0.05);
        let init = Bytes::from_static(b"init-a");

        sink.push_chunk(Bytes::from_static(b"c1"), Some(init.clone()), info(1))
            .await
            .unwrap();
        sink.push_chunk(Bytes::from_static(b"c2"), Some(init), info(2))
            .await
            .unwrap();

        assert_eq!(
            host.calls(),
            vec![
                HostCall::Append { init: true, range: None },
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
        assert_eq!(sink.inventory().chunks().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_forces_init_again() {
        let host = Arc::new(MemoryHostBuffer::new());
        let sink = BufferSink::new(MediaType::Audio, host.clone(), 0.05);
        let init = Bytes::from_static(b"init-a");

        sink.push_chunk(Bytes::from_static(b"c1"), Some(init.clone()), info(1))
            .await
            .unwrap();
        host.fail_next_append("quota exceeded");
        let err = sink
            .push_chunk(Bytes::from_static(b"c2"), Some(init.clone()), info(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BufferAppend { .. }));

        sink.push_chunk(Bytes::from_static(b"c2"), Some(init), info(2))
            .await
            .unwrap();
        let inits = host
            .calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Append { init: true, .. }))
            .count();
        assert_eq!(inits, 2);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_queue_running() {
        let host = Arc::new(MemoryHostBuffer::new());
        let sink = BufferSink::new(MediaType::Video, host.clone(), 0.05);
        sink.push_chunk(Bytes::from_static(b"c1"), None, info(1))
            .await
            .unwrap();
        host.fail_next_remove("busy");

        let (removed, pushed) = tokio::join!(
            sink.remove_buffer(0.0, 4.0),
            sink.push_chunk(Bytes::from_static(b"c2"), None, info(2)),
        );
        assert!(matches!(removed, Err(Error::BufferRemove { start, .. }) if start == 0.0));
        pushed.unwrap();
        assert_eq!(host.buffered_ranges(), vec![TimeRange::new(0.0, 8.0)]);
        assert_eq!(sink.inventory().chunks().len(), 2);
    }

    #[tokio::test]
    async fn test_end_of_segment_completes_chunk() {
        let host = Arc::new(MemoryHostBuffer::new());
        let sink = BufferSink::new(MediaType::Video, host, 0.05);
        sink.push_chunk(Bytes::from_static(b"c1"), None, info(1))
            .await
            .unwrap();
        assert!(!sink.inventory().chunks()[0].complete);
        sink.end_of_segment(info(1)).await.unwrap();
        assert!(sink.inventory().covers(0.0, 4.0, 0, 0.05));
    }

    #[tokio::test]
    async fn test_dispose_fails_operations() {
        let host = Arc::new(MemoryHostBuffer::new());
        let sink = BufferSink::new(MediaType::Video, host, 0.05);
        sink.dispose();
        let err = sink.remove_buffer(0.0, 10.0).await.unwrap_err();
        assert_eq!(
            err,
            Error::BufferDisposed {
                media_type: MediaType::Video
            }
        );
    }

    #[tokio::test]
    async fn test_dispose_fails_queued_operations() {
        let host = Arc::new(MemoryHostBuffer::new());
        let sink = BufferSink::new(MediaType::Audio, host.clone(), 0.05);

        let (first, second, _) = tokio::join!(
            sink.push_chunk(Bytes::from_static(b"c1"), None, info(1)),
            sink.remove_buffer(0.0, 4.0),
            async { sink.dispose() },
        );
        let disposed = Error::BufferDisposed {
            media_type: MediaType::Audio,
        };
        assert_eq!(first.unwrap_err(), disposed);
        assert_eq!(second.unwrap_err(), disposed);
        assert!(host.calls().is_empty());
        assert!(sink.inventory().is_empty());
    }

    #[tokio::test]
    async fn test_collect_garbage() {
        let host = Arc::new(MemoryHostBuffer::new());
        let sink = BufferSink::new(MediaType::Video, host.clone(), 0.05);
        for number in 1..=25 {
            sink.push_chunk(Bytes::from_static(b"c"), None, info(number))
                .await
                .unwrap();
        }
        assert_eq!(host.buffered_ranges(), vec![TimeRange::new(0.0, 100.0)]);

        sink.collect_garbage(50.0, &GarbageCollector::new(10.0, 20.0))
            .await
            .unwrap();
        assert_eq!(host.buffered_ranges(), vec![TimeRange::new(40.0, 70.0)]);
        assert!(host.calls().contains(&HostCall::Remove {
            start: 0.0,
            end: 40.0
        }));
        assert!(host.calls().contains(&HostCall::Remove {
            start: 70.0,
            end: 100.0
        }));
    }
}
