//! Keyed table of active relays.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::RwLock;

use crate::key::StreamKey;
use crate::relay::{RelayConfig, RelayStats, StreamRelay};

/// Registry of active relays.
///
/// Holds at most one relay per key. The table lock is only held for map
/// operations, never while a relay is doing I/O.
pub struct RelayRegistry {
    /// Map of stream keys to relays.
    relays: RwLock<HashMap<StreamKey, Arc<StreamRelay>>>,
    /// Configuration for newly created relays.
    config: RelayConfig,
}

impl RelayRegistry {
    /// Create an empty registry.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            relays: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the relay for `key`, if one exists.
    pub async fn get(&self, key: &StreamKey) -> Option<Arc<StreamRelay>> {
        self.relays.read().await.get(key).cloned()
    }

    /// Get or create the relay for `key`.
    ///
    /// Returns the relay and whether it was created by this call.
    pub async fn get_or_create(&self, key: &StreamKey) -> (Arc<StreamRelay>, bool) {
        // Fast path: relay already exists
        {
            let relays = self.relays.read().await;
            if let Some(relay) = relays.get(key) {
                return (Arc::clone(relay), false);
            }
        }

        let mut relays = self.relays.write().await;

        // Double-check after acquiring write lock
        if let Some(relay) = relays.get(key) {
            debug!("[RelayRegistry] Reusing relay for {} (after lock)", key);
            return (Arc::clone(relay), false);
        }

        let relay = StreamRelay::new(key.clone(), self.config.clone());
        relays.insert(key.clone(), Arc::clone(&relay));
        info!("[RelayRegistry] Created relay for {}, active: {}", key, relays.len());
        (relay, true)
    }

    /// Remove the relay for `key`, whatever instance it is.
    pub async fn remove(&self, key: &StreamKey) -> Option<Arc<StreamRelay>> {
        let removed = self.relays.write().await.remove(key);
        if removed.is_some() {
            info!("[RelayRegistry] Removed relay for {}", key);
        }
        removed
    }

    /// Remove the entry for `key` only if it still refers to `relay`.
    ///
    /// A newer relay registered under the same key is left untouched.
    pub async fn remove_if_same(&self, key: &StreamKey, relay: &Arc<StreamRelay>) -> bool {
        let mut relays = self.relays.write().await;
        match relays.get(key) {
            Some(current) if Arc::ptr_eq(current, relay) => {
                relays.remove(key);
                info!("[RelayRegistry] Removed relay for {}, active: {}", key, relays.len());
                true
            }
            _ => false,
        }
    }

    /// Retire and remove every relay without viewers.
    ///
    /// Returns the number of relays evicted.
    pub async fn evict_empty(&self) -> usize {
        let mut relays = self.relays.write().await;
        let before = relays.len();
        relays.retain(|key, relay| {
            if relay.retire_if_empty() {
                info!("[RelayRegistry] Evicting empty relay {}", key);
                false
            } else {
                true
            }
        });
        before - relays.len()
    }

    /// Close every relay and clear the table.
    pub async fn stop_all(&self) {
        let relays: Vec<Arc<StreamRelay>> = {
            let mut table = self.relays.write().await;
            table.drain().map(|(_, relay)| relay).collect()
        };

        if !relays.is_empty() {
            info!("[RelayRegistry] Stopping {} relays", relays.len());
        }
        futures::future::join_all(relays.iter().map(|relay| relay.close())).await;
    }

    /// Number of registered relays.
    pub async fn len(&self) -> usize {
        self.relays.read().await.len()
    }

    /// Check if no relays are registered.
    pub async fn is_empty(&self) -> bool {
        self.relays.read().await.is_empty()
    }

    /// Keys of all registered relays.
    pub async fn keys(&self) -> Vec<StreamKey> {
        self.relays.read().await.keys().cloned().collect()
    }

    /// Stats of all registered relays, sorted by key.
    pub async fn snapshot(&self) -> Vec<RelayStats> {
        let relays: Vec<Arc<StreamRelay>> = self.relays.read().await.values().cloned().collect();
        let mut stats: Vec<RelayStats> = relays.iter().map(|relay| relay.stats()).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
