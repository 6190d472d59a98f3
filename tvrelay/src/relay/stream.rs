//! Shared stream relay with fan-out and late-join catch-up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use crate::error::RelayError;
use crate::key::StreamKey;
use crate::relay::replay::{ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
use crate::relay::sink::{ClientSink, SinkId, DEFAULT_QUEUE_DEPTH};
use crate::relay::writer::RelayWriter;

/// Tuning parameters for a relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bytes retained for late joiners.
    pub replay_capacity: usize,
    /// Buffers each viewer may queue before evicting.
    pub queue_depth: usize,
    /// How long sinks may flush their queue when the upstream ends.
    pub close_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Registration for the next "became empty" event of a relay.
pub struct EmptySubscription {
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl EmptySubscription {
    /// Token to pass to [`StreamRelay::cancel_empty`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the event. Returns false if the subscription was canceled
    /// or the relay went away without firing.
    pub async fn fired(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// Client set plus the listeners waiting for it to drain.
///
/// Listeners live under the same lock as the sinks so that firing and
/// clearing them is atomic with the transition to empty.
struct ClientSet {
    sinks: HashMap<SinkId, ClientSink>,
    empty_listeners: HashMap<u64, oneshot::Sender<()>>,
    closed: bool,
}

impl ClientSet {
    fn fire_empty(&mut self) -> usize {
        let count = self.empty_listeners.len();
        for (_, tx) in self.empty_listeners.drain() {
            let _ = tx.send(());
        }
        count
    }
}

/// Statistics for a relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    /// Stream this relay serves.
    pub key: StreamKey,
    /// Number of attached viewers.
    pub clients: usize,
    /// Total bytes produced by the upstream.
    pub bytes_written: u64,
    /// Bytes currently held in the replay buffer.
    pub buffered_bytes: usize,
    /// Buffers dropped across attached viewers.
    pub dropped_buffers: u64,
    /// Seconds since the relay was created.
    pub age_secs: u64,
    /// Whether the relay is closed or retired.
    pub closed: bool,
}

/// One logical stream: a replay buffer and the set of attached viewers.
///
/// The client set and the replay buffer have separate locks. Lock order is
/// always client set first, then replay buffer. Neither lock is held across
/// an `.await`.
pub struct StreamRelay {
    key: StreamKey,
    config: RelayConfig,
    clients: RwLock<ClientSet>,
    replay: RwLock<ReplayBuffer>,
    next_sink_id: AtomicU64,
    next_listener_id: AtomicU64,
    bytes_written: AtomicU64,
    created_at: Instant,
}

impl StreamRelay {
    /// Create a new relay for the given key.
    pub fn new(key: StreamKey, config: RelayConfig) -> Arc<Self> {
        let replay = ReplayBuffer::new(config.replay_capacity);
        Arc::new(Self {
            key,
            config,
            clients: RwLock::new(ClientSet {
                sinks: HashMap::new(),
                empty_listeners: HashMap::new(),
                closed: false,
            }),
            replay: RwLock::new(replay),
            next_sink_id: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
            bytes_written: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    /// The key this relay serves.
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Fan `data` out to every attached viewer.
    ///
    /// Never waits on a viewer. The full length is always reported, whatever
    /// happened to individual deliveries.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let clients = self.clients.read();
        self.replay.write().write(data);

        let buf = Bytes::copy_from_slice(data);
        for sink in clients.sinks.values() {
            sink.enqueue(buf.clone());
        }
        drop(clients);

        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        data.len()
    }

    /// An [`AsyncWrite`] handle producing into this relay.
    pub fn writer(self: &Arc<Self>) -> RelayWriter {
        RelayWriter::new(Arc::clone(self))
    }

    /// Attach a viewer destination.
    ///
    /// The current replay contents are queued to the new sink, oldest bytes
    /// first, before any later write can reach it. Returns the sink id and
    /// whether the client set was empty just before.
    pub fn add_client<W>(&self, destination: W) -> Result<(SinkId, bool), RelayError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut clients = self.clients.write();
        if clients.closed {
            return Err(RelayError::Closed);
        }

        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let sink = ClientSink::spawn(id, destination, self.config.queue_depth);

        let catchup = self.replay.read().snapshot();
        if !catchup.is_empty() {
            debug!(
                "[StreamRelay] Replaying {} bytes to client {} of {}",
                catchup.len(),
                id,
                self.key
            );
            sink.enqueue(catchup);
        }

        let is_first = clients.sinks.is_empty();
        clients.sinks.insert(id, sink);
        info!(
            "[StreamRelay] Client {} added to {}, total: {}",
            id,
            self.key,
            clients.sinks.len()
        );

        Ok((id, is_first))
    }

    /// Detach a viewer without waiting for its delivery task.
    ///
    /// Fires the empty signal if this was the last viewer.
    pub fn detach_client(&self, id: SinkId) -> Option<ClientSink> {
        let mut clients = self.clients.write();
        let sink = clients.sinks.remove(&id)?;

        info!(
            "[StreamRelay] Client {} removed from {}, remaining: {}",
            id,
            self.key,
            clients.sinks.len()
        );

        if clients.sinks.is_empty() {
            let fired = clients.fire_empty();
            debug!("[StreamRelay] {} is empty, notified {} listeners", self.key, fired);
        }
        Some(sink)
    }

    /// Detach and close a viewer. Returns false if the id was unknown.
    pub async fn remove_client(&self, id: SinkId) -> bool {
        match self.detach_client(id) {
            Some(sink) => {
                sink.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every sink and refuse new viewers.
    ///
    /// Queued data is flushed for up to the configured grace period, then
    /// every destination is closed so readers see end-of-stream.
    pub async fn close(&self) {
        let sinks: Vec<ClientSink> = {
            let mut clients = self.clients.write();
            clients.closed = true;
            let sinks = clients.sinks.drain().map(|(_, sink)| sink).collect();
            clients.fire_empty();
            sinks
        };

        if !sinks.is_empty() {
            info!("[StreamRelay] Closing {} clients of {}", sinks.len(), self.key);
        }

        let grace = self.config.close_grace;
        futures::future::join_all(sinks.into_iter().map(|sink| sink.close_within(grace))).await;
    }

    /// Mark the relay closed if it has no viewers.
    ///
    /// Returns true if the relay is (now) closed. Used for eviction so that a
    /// viewer cannot attach to a relay that is being removed.
    pub fn retire_if_empty(&self) -> bool {
        let mut clients = self.clients.write();
        if clients.closed {
            return true;
        }
        if clients.sinks.is_empty() {
            clients.closed = true;
            clients.fire_empty();
            debug!("[StreamRelay] Retired {}", self.key);
            return true;
        }
        false
    }

    /// Refuse new viewers while keeping the attached ones.
    ///
    /// Used once the upstream has ended, so that nobody joins a stream that
    /// is about to be closed.
    pub fn retire(&self) {
        let mut clients = self.clients.write();
        if !clients.closed {
            clients.closed = true;
            debug!("[StreamRelay] Retired {} with {} clients", self.key, clients.sinks.len());
        }
    }

    /// Register interest in the next "became empty" event.
    ///
    /// If the relay has no viewers right now the subscription fires at once.
    pub fn subscribe_empty(&self) -> EmptySubscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut clients = self.clients.write();
        if clients.sinks.is_empty() {
            let _ = tx.send(());
        } else {
            clients.empty_listeners.insert(id, tx);
        }

        EmptySubscription { id, rx }
    }

    /// Withdraw a subscription made with [`subscribe_empty`](Self::subscribe_empty).
    pub fn cancel_empty(&self, id: u64) {
        self.clients.write().empty_listeners.remove(&id);
    }

    /// Number of attached viewers.
    pub fn client_count(&self) -> usize {
        self.clients.read().sinks.len()
    }

    /// Check if no viewers are attached.
    pub fn is_empty(&self) -> bool {
        self.clients.read().sinks.is_empty()
    }

    /// Check if the relay is closed or retired.
    pub fn is_closed(&self) -> bool {
        self.clients.read().closed
    }

    /// Total bytes produced into this relay.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Snapshot of this relay's counters.
    pub fn stats(&self) -> RelayStats {
        let clients = self.clients.read();
        let dropped_buffers = clients.sinks.values().map(|s| s.dropped()).sum();
        RelayStats {
            key: self.key.clone(),
            clients: clients.sinks.len(),
            bytes_written: self.bytes_written(),
            buffered_bytes: self.replay.read().len(),
            dropped_buffers,
            age_secs: self.created_at.elapsed().as_secs(),
            closed: clients.closed,
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        debug!("StreamRelay dropped for {}", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn small_config(replay_capacity: usize) -> RelayConfig {
        RelayConfig {
            replay_capacity,
            queue_depth: 64,
            close_grace: Duration::from_secs(1),
        }
    }

    async fn read_all(mut reader: DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_first_client_flag() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(64));
        let (_r1, w1) = tokio::io::duplex(64);
        let (_r2, w2) = tokio::io::duplex(64);

        let (id1, first1) = relay.add_client(w1).unwrap();
        let (_id2, first2) = relay.add_client(w2).unwrap();
        assert!(first1);
        assert!(!first2);
        assert_eq!(relay.client_count(), 2);

        assert!(relay.remove_client(id1).await);
        assert!(!relay.remove_client(id1).await);
        assert_eq!(relay.client_count(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_clients() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(0));
        let (r1, w1) = tokio::io::duplex(1024);
        let (r2, w2) = tokio::io::duplex(1024);
        relay.add_client(w1).unwrap();
        relay.add_client(w2).unwrap();

        assert_eq!(relay.write(b"one "), 4);
        assert_eq!(relay.write(b"two"), 3);
        relay.close().await;

        assert_eq!(read_all(r1).await, b"one two");
        assert_eq!(read_all(r2).await, b"one two");
        assert_eq!(relay.bytes_written(), 7);
    }

    #[tokio::test]
    async fn test_late_join_catch_up_after_wrap() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(8));
        relay.write(b"0123");
        relay.write(b"456789");

        let (reader, writer) = tokio::io::duplex(1024);
        let (_, first) = relay.add_client(writer).unwrap();
        assert!(first);
        relay.write(b"AB");
        relay.close().await;

        assert_eq!(read_all(reader).await, b"23456789AB");
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(0));
        // Never read: its queue fills and starts evicting.
        let (_stalled, w_slow) = tokio::io::duplex(1);
        let (fast, w_fast) = tokio::io::duplex(64 * 1024);
        relay.add_client(w_slow).unwrap();
        relay.add_client(w_fast).unwrap();

        let start = Instant::now();
        for i in 0..200u8 {
            assert_eq!(relay.write(&[i; 100]), 100);
            tokio::task::yield_now().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(relay.stats().dropped_buffers > 0);

        let reader = tokio::spawn(read_all(fast));
        relay.close().await;
        let received = reader.await.unwrap();
        assert_eq!(received.len(), 200 * 100);
    }

    #[tokio::test]
    async fn test_empty_signal_fires_once_for_all_listeners() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(0));
        let (_r, w) = tokio::io::duplex(64);
        let (id, _) = relay.add_client(w).unwrap();

        let a = relay.subscribe_empty();
        let b = relay.subscribe_empty();
        let c = relay.subscribe_empty();
        relay.cancel_empty(c.id());

        relay.remove_client(id).await;
        assert!(a.fired().await);
        assert!(b.fired().await);
        assert!(!c.fired().await);
    }

    #[tokio::test]
    async fn test_subscribe_on_empty_relay_fires_immediately() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(0));
        assert!(relay.subscribe_empty().fired().await);
    }

    #[tokio::test]
    async fn test_retired_relay_rejects_clients() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(0));
        assert!(relay.retire_if_empty());

        let (mut reader, writer) = tokio::io::duplex(64);
        assert_eq!(relay.add_client(writer).err(), Some(RelayError::Closed));

        // The rejected destination was dropped, so its reader sees EOF.
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_retire_keeps_attached_clients() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(64));
        let (reader, writer) = tokio::io::duplex(1024);
        relay.add_client(writer).unwrap();
        relay.write(b"tail");

        relay.retire();
        assert!(relay.is_closed());
        assert_eq!(relay.client_count(), 1);

        let (_late, late_writer) = tokio::io::duplex(64);
        assert_eq!(relay.add_client(late_writer).err(), Some(RelayError::Closed));

        relay.close().await;
        assert_eq!(read_all(reader).await, b"tail");
    }

    #[tokio::test]
    async fn test_retire_skips_busy_relay() {
        let relay = StreamRelay::new(StreamKey::new("chA"), small_config(0));
        let (_r, w) = tokio::io::duplex(64);
        relay.add_client(w).unwrap();

        assert!(!relay.retire_if_empty());
        assert!(!relay.is_closed());
    }
}
