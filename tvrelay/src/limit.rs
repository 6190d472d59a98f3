//! Concurrency limits for upstream pulls.
//!
//! A [`ConcurrencyLimit`] is a weighted counting resource backed by a tokio
//! semaphore. The broker acquires one permit from every limit attached to a
//! request when it starts an upstream pull, and holds the resulting
//! [`PermitSet`] for the lifetime of that pull. Permits are released on drop,
//! so a permit can never be released twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::LimitError;

struct LimitInner {
    name: String,
    semaphore: Arc<Semaphore>,
    capacity: u32,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// A named, shared cap on concurrent upstream pulls.
///
/// Cloning is cheap; clones share the same permits.
#[derive(Clone)]
pub struct ConcurrencyLimit {
    inner: Arc<LimitInner>,
}

impl ConcurrencyLimit {
    /// Create a limit allowing `capacity` units of weight at once.
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            inner: Arc::new(LimitInner {
                name: name.into(),
                semaphore: Arc::new(Semaphore::new(capacity as usize)),
                capacity,
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Name used in logs and stats.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Total capacity of this limit.
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Currently available weight.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Number of permits handed out so far.
    pub fn acquired_count(&self) -> u64 {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    /// Number of permits given back so far.
    pub fn released_count(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Wait for `weight` units to become available.
    pub async fn acquire(&self, weight: u32) -> Result<LimitPermit, LimitError> {
        self.check_weight(weight)?;
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_many_owned(weight)
            .await
            .map_err(|_| LimitError::Closed)?;
        Ok(self.wrap(permit))
    }

    /// Take `weight` units without waiting.
    pub fn try_acquire(&self, weight: u32) -> Result<LimitPermit, LimitError> {
        self.check_weight(weight)?;
        let permit = self
            .inner
            .semaphore
            .clone()
            .try_acquire_many_owned(weight)
            .map_err(|e| match e {
                tokio::sync::TryAcquireError::Closed => LimitError::Closed,
                tokio::sync::TryAcquireError::NoPermits => LimitError::Exhausted,
            })?;
        Ok(self.wrap(permit))
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> LimitStats {
        LimitStats {
            name: self.inner.name.clone(),
            capacity: self.inner.capacity,
            available: self.available(),
            acquired: self.acquired_count(),
            released: self.released_count(),
        }
    }

    fn check_weight(&self, weight: u32) -> Result<(), LimitError> {
        if weight > self.inner.capacity {
            return Err(LimitError::WeightTooLarge {
                weight,
                capacity: self.inner.capacity,
            });
        }
        Ok(())
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> LimitPermit {
        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        LimitPermit {
            _permit: permit,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for ConcurrencyLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimit")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Counters for a [`ConcurrencyLimit`].
#[derive(Debug, Clone, Serialize)]
pub struct LimitStats {
    pub name: String,
    pub capacity: u32,
    pub available: usize,
    pub acquired: u64,
    pub released: u64,
}

/// Weight held from one [`ConcurrencyLimit`]; released on drop.
pub struct LimitPermit {
    _permit: OwnedSemaphorePermit,
    inner: Arc<LimitInner>,
}

impl Drop for LimitPermit {
    fn drop(&mut self) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// All permits held by one upstream pull.
#[derive(Default)]
pub struct PermitSet {
    permits: Vec<LimitPermit>,
}

impl PermitSet {
    /// Acquire weight 1 from every limit in order, giving up after `timeout`.
    ///
    /// Either every permit is obtained or none is held when this returns.
    /// A timeout is reported as [`LimitError::Exhausted`].
    pub async fn acquire_all(
        limits: &[ConcurrencyLimit],
        timeout: Duration,
    ) -> Result<PermitSet, LimitError> {
        let acquire = async {
            let mut set = PermitSet::default();
            for limit in limits {
                set.permits.push(limit.acquire(1).await?);
            }
            Ok(set)
        };

        match tokio::time::timeout(timeout, acquire).await {
            Ok(result) => result,
            Err(_) => Err(LimitError::Exhausted),
        }
    }

    /// Number of permits held.
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    /// Returns true if no permits are held (unlimited request).
    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }
}
