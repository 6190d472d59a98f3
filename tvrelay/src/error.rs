//! Error types for the stream relay core.

use thiserror::Error;

/// Errors surfaced to callers of [`StreamBroker::open`](crate::StreamBroker::open).
#[derive(Error, Debug)]
pub enum BrokerError {
    /// No upstream slot could be obtained in time.
    ///
    /// Callers should treat this as "try again later" and render a
    /// rate-limited fallback rather than an upstream failure.
    #[error("Capacity exceeded: no upstream slot available")]
    CapacityExceeded,

    /// The stream key was empty.
    #[error("Invalid stream key: {0:?}")]
    InvalidKey(String),

    /// The broker has been shut down.
    #[error("Broker closed")]
    Closed,
}

impl BrokerError {
    /// Returns true if the caller should back off and retry later.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, BrokerError::CapacityExceeded)
    }
}

/// Errors from relay operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The relay was closed or retired and no longer accepts clients.
    #[error("Relay closed")]
    Closed,
}

/// Errors returned by a [`Streamer`](crate::Streamer) pull.
#[derive(Error, Debug)]
pub enum PullError {
    /// The pull was canceled through its cancellation scope.
    #[error("Pull canceled")]
    Canceled,

    /// I/O failure while reading the upstream or writing to the relay.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The upstream process could not be started.
    #[error("Failed to spawn upstream: {0}")]
    Spawn(String),

    /// The upstream answered with a failure.
    #[error("Upstream failed: {0}")]
    Upstream(String),
}

/// Errors from acquiring a concurrency limit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// The requested weight exceeds the limit's total capacity.
    #[error("Weight {weight} exceeds limit capacity {capacity}")]
    WeightTooLarge { weight: u32, capacity: u32 },

    /// No permits available right now.
    #[error("No permits available")]
    Exhausted,

    /// The limit's semaphore was closed.
    #[error("Limit closed")]
    Closed,
}
