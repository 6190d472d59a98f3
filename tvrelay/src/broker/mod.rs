//! Stream broker: the entry point for viewers.
//!
//! [`StreamBroker::open`] attaches a viewer to the relay for its key and
//! makes sure exactly one upstream pull runs per active key. The first
//! viewer of a key acquires the request's concurrency permits and starts
//! the pull; later viewers only join the broadcast. When the last viewer
//! leaves, the relay's empty signal cancels the pull and the permits are
//! released.

mod key_lock;
mod pull;

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::error::{BrokerError, RelayError};
use crate::key::StreamKey;
use crate::limit::{ConcurrencyLimit, PermitSet};
use crate::registry::RelayRegistry;
use crate::relay::{RelayConfig, RelayStats, SinkId, StreamRelay};
use crate::streamer::Streamer;

use key_lock::KeyLocks;

/// Default time a first viewer waits for an upstream slot.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the in-memory pipe between a sink and its reader.
pub const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Settings for each relay.
    pub relay: RelayConfig,
    /// How long the first viewer of a key waits for permits.
    pub acquire_timeout: Duration,
    /// Capacity of each viewer's pipe in bytes. Zero is treated as one.
    pub pipe_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// A viewer's request for a stream.
pub struct StreamRequest {
    /// Identity of the stream.
    pub key: StreamKey,
    /// Producer used if this viewer has to start the upstream.
    pub streamer: Arc<dyn Streamer>,
    /// Limits to acquire one unit from before starting the upstream.
    /// Empty means unlimited.
    pub permits: Vec<ConcurrencyLimit>,
    /// The viewer's own scope. Canceling it detaches only this viewer.
    pub cancel: CancellationToken,
}

impl StreamRequest {
    /// Create an unlimited request with a fresh viewer scope.
    pub fn new(key: impl Into<StreamKey>, streamer: Arc<dyn Streamer>) -> Self {
        Self {
            key: key.into(),
            streamer,
            permits: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Add a concurrency limit to acquire from.
    pub fn with_limit(mut self, limit: ConcurrencyLimit) -> Self {
        self.permits.push(limit);
        self
    }

    /// Use the given viewer scope.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Default)]
struct BrokerCounters {
    opens: AtomicU64,
    pulls_started: AtomicU64,
    pulls_failed: AtomicU64,
    capacity_rejections: AtomicU64,
}

/// Broker-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub active_relays: usize,
    pub active_viewers: usize,
    pub opens: u64,
    pub pulls_started: u64,
    pub pulls_failed: u64,
    pub capacity_rejections: u64,
}

struct BrokerInner {
    registry: RelayRegistry,
    locks: KeyLocks,
    /// Parent of every pull scope.
    shutdown: CancellationToken,
    tasks: TaskTracker,
    config: BrokerConfig,
    counters: BrokerCounters,
}

impl BrokerInner {
    /// Detach a viewer. Runs under the key lock so that a relay that just
    /// became empty is retired before any new viewer can join it.
    async fn depart(&self, key: &StreamKey, relay: &Arc<StreamRelay>, sink_id: SinkId) {
        let sink = {
            let _guard = self.locks.lock(key).await;
            let sink = relay.detach_client(sink_id);
            if relay.retire_if_empty() {
                self.registry.remove_if_same(key, relay).await;
            }
            sink
        };

        if let Some(sink) = sink {
            sink.close().await;
            debug!("[StreamBroker] Viewer {} left {}", sink_id, key);
        }
    }
}

/// Shares upstream pulls between viewers of the same stream.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct StreamBroker {
    inner: Arc<BrokerInner>,
}

impl StreamBroker {
    /// Create a broker.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                registry: RelayRegistry::new(config.relay.clone()),
                locks: KeyLocks::default(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                config,
                counters: BrokerCounters::default(),
            }),
        }
    }

    /// Attach a viewer to the stream identified by `request.key`.
    ///
    /// Starts the upstream pull if this viewer is the first one. Returns
    /// [`BrokerError::CapacityExceeded`] if the pull could not obtain its
    /// permits within the configured timeout.
    pub async fn open(&self, request: StreamRequest) -> Result<StreamReader, BrokerError> {
        let StreamRequest {
            key,
            streamer,
            permits,
            cancel,
        } = request;

        if key.is_empty() {
            return Err(BrokerError::InvalidKey(key.to_string()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        self.inner.counters.opens.fetch_add(1, Ordering::Relaxed);

        let key_guard = self.inner.locks.lock(&key).await;

        let (reader, pending) = loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(BrokerError::Closed);
            }

            let (reader, writer) = tokio::io::duplex(self.inner.config.pipe_capacity.max(1));
            let (relay, _) = self.inner.registry.get_or_create(&key).await;
            match relay.add_client(writer) {
                Ok((sink_id, is_first)) => {
                    break (
                        reader,
                        PendingViewer {
                            relay,
                            sink_id,
                            is_first,
                            armed: true,
                        },
                    );
                }
                Err(RelayError::Closed) => {
                    debug!("[StreamBroker] Relay for {} is retired, replacing it", key);
                    self.inner.registry.remove_if_same(&key, &relay).await;
                }
            }
        };

        let sink_id = pending.sink_id;
        if pending.is_first {
            let acquired = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => Err(BrokerError::Closed),
                result = PermitSet::acquire_all(&permits, self.inner.config.acquire_timeout) => {
                    result.map_err(|e| {
                        warn!("[StreamBroker] No upstream slot for {}: {}", key, e);
                        BrokerError::CapacityExceeded
                    })
                }
            };

            let permit_set = match acquired {
                Ok(set) => set,
                Err(e) => {
                    if e.is_capacity_exceeded() {
                        self.inner
                            .counters
                            .capacity_rejections
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    let relay = pending.disarm();
                    if let Some(sink) = relay.detach_client(sink_id) {
                        sink.close().await;
                    }
                    if relay.retire_if_empty() {
                        self.inner.registry.remove_if_same(&key, &relay).await;
                    }
                    return Err(e);
                }
            };

            let relay = &pending.relay;
            self.inner.counters.pulls_started.fetch_add(1, Ordering::Relaxed);
            info!(
                "[StreamBroker] Starting upstream for {} ({} permits held)",
                key,
                permit_set.len()
            );
            self.inner.tasks.spawn(pull::run_pull(
                Arc::clone(&self.inner),
                key.clone(),
                Arc::clone(relay),
                streamer,
                permit_set,
                self.inner.shutdown.child_token(),
            ));
        } else {
            debug!("[StreamBroker] Viewer {} joined running stream {}", sink_id, key);
        }

        let relay = pending.disarm();
        drop(key_guard);

        let viewer = cancel.child_token();
        let watch = viewer.clone();
        let inner = Arc::clone(&self.inner);
        let watch_key = key.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = watch.cancelled() => {}
                _ = inner.shutdown.cancelled() => {}
            }
            inner.depart(&watch_key, &relay, sink_id).await;
        });

        Ok(StreamReader {
            reader,
            key,
            sink_id,
            _viewer: viewer.drop_guard(),
        })
    }

    /// Cancel every pull, close every relay and wait for background tasks.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("[StreamBroker] Shutting down");

        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.registry.stop_all().await;
        self.inner.tasks.wait().await;

        info!("[StreamBroker] Shutdown complete");
    }

    /// Check if [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Evict relays that have no viewers. Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let evicted = self.inner.registry.evict_empty().await;
        if evicted > 0 {
            info!("[StreamBroker] Swept {} idle relays", evicted);
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `period` until shutdown.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = broker.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        broker.sweep().await;
                    }
                }
            }
        })
    }

    /// Stop the stream for `key` and disconnect its viewers.
    ///
    /// Returns false if no relay was active. The pull ends through the
    /// relay's empty signal, releasing its permits.
    pub async fn stop(&self, key: &StreamKey) -> bool {
        let relay = {
            let _guard = self.inner.locks.lock(key).await;
            self.inner.registry.remove(key).await
        };

        match relay {
            Some(relay) => {
                info!("[StreamBroker] Stopping {} ({} viewers)", key, relay.client_count());
                relay.close().await;
                true
            }
            None => false,
        }
    }

    /// Keys of every active stream.
    pub async fn active_keys(&self) -> Vec<StreamKey> {
        self.inner.registry.keys().await
    }

    /// The relay currently serving `key`, if any.
    pub async fn relay(&self, key: &StreamKey) -> Option<Arc<StreamRelay>> {
        self.inner.registry.get(key).await
    }

    /// Stats of every active relay.
    pub async fn relay_stats(&self) -> Vec<RelayStats> {
        self.inner.registry.snapshot().await
    }

    /// Broker-wide counters.
    pub async fn stats(&self) -> BrokerStats {
        let relays = self.inner.registry.snapshot().await;
        let counters = &self.inner.counters;
        BrokerStats {
            active_relays: relays.len(),
            active_viewers: relays.iter().map(|r| r.clients).sum(),
            opens: counters.opens.load(Ordering::Relaxed),
            pulls_started: counters.pulls_started.load(Ordering::Relaxed),
            pulls_failed: counters.pulls_failed.load(Ordering::Relaxed),
            capacity_rejections: counters.capacity_rejections.load(Ordering::Relaxed),
        }
    }
}

impl Default for StreamBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// A sink registered by `open` that is not yet owned by a watcher task.
///
/// If `open` is abandoned midway the sink is detached on drop, so a relay
/// never keeps a viewer that nobody will remove.
struct PendingViewer {
    relay: Arc<StreamRelay>,
    sink_id: SinkId,
    is_first: bool,
    armed: bool,
}

impl PendingViewer {
    fn disarm(mut self) -> Arc<StreamRelay> {
        self.armed = false;
        Arc::clone(&self.relay)
    }
}

impl Drop for PendingViewer {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "[StreamBroker] Open for {} abandoned, detaching viewer {}",
                self.relay.key(),
                self.sink_id
            );
            drop(self.relay.detach_client(self.sink_id));
            self.relay.retire_if_empty();
        }
    }
}

/// The viewer's end of a stream.
///
/// Dropping the reader detaches the viewer from its relay.
pub struct StreamReader {
    reader: DuplexStream,
    key: StreamKey,
    sink_id: SinkId,
    _viewer: DropGuard,
}

impl StreamReader {
    /// Key of the stream being read.
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Identifier of this viewer's sink.
    pub fn sink_id(&self) -> SinkId {
        self.sink_id
    }
}

impl AsyncRead for StreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("key", &self.key)
            .field("sink_id", &self.sink_id)
            .finish()
    }
}
