//! Per-key async mutexes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::key::StreamKey;

type LockMap = Mutex<HashMap<StreamKey, Arc<AsyncMutex<()>>>>;

/// One async mutex per stream key, created on demand.
///
/// Entries are dropped again once nobody holds or waits for them, so the
/// map only ever contains keys with activity in flight.
#[derive(Clone, Default)]
pub(crate) struct KeyLocks {
    map: Arc<LockMap>,
}

impl KeyLocks {
    /// Wait for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: &StreamKey) -> KeyGuard {
        let entry = {
            let mut map = self.map.lock();
            Arc::clone(map.entry(key.clone()).or_default())
        };

        // Built before awaiting so a canceled wait still cleans up the entry.
        let mut guard = KeyGuard {
            map: Arc::clone(&self.map),
            key: key.clone(),
            entry,
            held: None,
        };
        guard.held = Some(Arc::clone(&guard.entry).lock_owned().await);
        guard
    }

    /// Number of keys with a holder or waiter.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}

/// Exclusive access to one key; released on drop.
pub(crate) struct KeyGuard {
    map: Arc<LockMap>,
    key: StreamKey,
    entry: Arc<AsyncMutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.held.take();

        let mut map = self.map.lock();
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.entry) == 2 {
            if let Some(current) = map.get(&self.key) {
                if Arc::ptr_eq(current, &self.entry) {
                    map.remove(&self.key);
                }
            }
        }
    }
}
