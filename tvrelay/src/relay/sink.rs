//! Per-viewer delivery with a bounded, lossy queue.
//!
//! A [`ClientSink`] owns one viewer's destination writer. The relay hands it
//! buffers through [`ClientSink::enqueue`], which never waits: when the queue
//! is full the oldest queued buffer is evicted to make room. A slow viewer
//! therefore loses data instead of stalling the broadcast.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default number of buffers a sink may hold before evicting.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Identifier of a sink within its relay.
pub type SinkId = u64;

struct SinkQueue {
    buffers: VecDeque<Bytes>,
    closed: bool,
}

struct SinkShared {
    queue: Mutex<SinkQueue>,
    notify: Notify,
    /// Aborts an in-flight write on close.
    cancel: CancellationToken,
    depth: usize,
    bytes_delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicBool,
}

impl SinkShared {
    fn close_queue(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }
}

/// One viewer's delivery queue and its delivery task.
pub struct ClientSink {
    id: SinkId,
    shared: Arc<SinkShared>,
    worker: Option<JoinHandle<()>>,
}

impl ClientSink {
    /// Create a sink and spawn its delivery task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<W>(id: SinkId, destination: W, depth: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let depth = depth.max(1);
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(SinkQueue {
                buffers: VecDeque::with_capacity(depth),
                closed: false,
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            depth,
            bytes_delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        });

        let worker = tokio::spawn(deliver(id, Arc::clone(&shared), destination));

        Self {
            id,
            shared,
            worker: Some(worker),
        }
    }

    /// Sink identifier.
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Offer a buffer for delivery without waiting.
    ///
    /// Returns false if data was lost: either the oldest queued buffer was
    /// evicted to make room, or the sink is closed and `data` was discarded.
    pub fn enqueue(&self, data: Bytes) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut lossless = true;
        if queue.buffers.len() >= self.shared.depth {
            queue.buffers.pop_front();
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                debug!("[ClientSink {}] Queue full, dropped {} buffers so far", self.id, dropped);
            }
            lossless = false;
        }
        queue.buffers.push_back(data);
        drop(queue);

        self.shared.notify.notify_one();
        lossless
    }

    /// Number of buffers waiting for delivery.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().buffers.len()
    }

    /// Total bytes written to the destination.
    pub fn bytes_delivered(&self) -> u64 {
        self.shared.bytes_delivered.load(Ordering::Relaxed)
    }

    /// Total buffers lost to eviction or late delivery.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Returns true once a write to the destination has failed.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Close immediately, discarding anything still queued.
    pub async fn close(self) {
        self.close_within(Duration::ZERO).await
    }

    /// Close the queue and let the delivery task flush for up to `grace`.
    ///
    /// The delivery task has exited when this returns; no write to the
    /// destination happens afterwards.
    pub async fn close_within(mut self, grace: Duration) {
        self.shared.close_queue();

        let Some(mut worker) = self.worker.take() else {
            return;
        };

        if !grace.is_zero() && tokio::time::timeout(grace, &mut worker).await.is_ok() {
            return;
        }

        self.shared.cancel.cancel();
        let _ = worker.await;
    }
}

impl Drop for ClientSink {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shared.close_queue();
            self.shared.cancel.cancel();
        }
    }
}

async fn deliver<W>(id: SinkId, shared: Arc<SinkShared>, mut destination: W)
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let next = loop {
            {
                let mut queue = shared.queue.lock();
                if let Some(buf) = queue.buffers.pop_front() {
                    break Some(buf);
                }
                if queue.closed {
                    break None;
                }
            }
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break None,
                _ = shared.notify.notified() => {}
            }
        };

        let Some(buf) = next else {
            break;
        };

        // Destination is gone; keep draining so the queue never backs up.
        if shared.failed.load(Ordering::SeqCst) {
            continue;
        }

        let result = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = destination.write_all(&buf) => result,
        };

        match result {
            Ok(()) => {
                shared
                    .bytes_delivered
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                trace!("[ClientSink {}] Delivered {} bytes", id, buf.len());
            }
            Err(e) => {
                debug!("[ClientSink {}] Destination write failed: {}", id, e);
                shared.failed.store(true, Ordering::SeqCst);
            }
        }
    }

    if !shared.failed.load(Ordering::SeqCst) && !shared.cancel.is_cancelled() {
        let _ = destination.shutdown().await;
    }
    debug!("[ClientSink {}] Delivery task stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_delivers_in_order() {
        let (mut reader, writer) = tokio::io::duplex(1024);
        let sink = ClientSink::spawn(1, writer, 8);

        assert!(sink.enqueue(Bytes::from_static(b"abc")));
        assert!(sink.enqueue(Bytes::from_static(b"def")));
        sink.close_within(Duration::from_secs(1)).await;

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest() {
        // A 1-byte pipe nobody reads: the worker blocks on the first write.
        let (_reader, writer) = tokio::io::duplex(1);
        let sink = ClientSink::spawn(7, writer, 2);

        for i in 0..10u8 {
            sink.enqueue(Bytes::from(vec![i; 4]));
        }

        assert!(sink.queued() <= 2);
        assert!(sink.dropped() >= 7);
        sink.close().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_dropped() {
        let (_reader, writer) = tokio::io::duplex(64);
        let sink = ClientSink::spawn(3, writer, 4);
        sink.shared.close_queue();

        assert!(!sink.enqueue(Bytes::from_static(b"late")));
        assert_eq!(sink.dropped(), 1);
        sink.close().await;
    }

    #[tokio::test]
    async fn test_close_does_not_hang_on_stalled_reader() {
        let (_reader, writer) = tokio::io::duplex(4);
        let sink = ClientSink::spawn(9, writer, 4);
        sink.enqueue(Bytes::from(vec![0u8; 64]));

        tokio::time::timeout(Duration::from_secs(2), sink.close_within(Duration::from_millis(50)))
            .await
            .expect("close must not wait for a stalled reader");
    }

    #[tokio::test]
    async fn test_write_error_marks_failed() {
        let (reader, writer) = tokio::io::duplex(16);
        drop(reader);
        let sink = ClientSink::spawn(5, writer, 4);

        sink.enqueue(Bytes::from_static(b"to nowhere"));
        for _ in 0..50 {
            if sink.is_failed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(sink.is_failed());

        // Still accepts (and silently drains) after failure.
        assert!(sink.enqueue(Bytes::from_static(b"more")));
        sink.close().await;
    }
}
