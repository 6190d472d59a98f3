//! Upstream producer contract.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::PullError;
use crate::relay::RelayWriter;

/// Something that can pull bytes from an upstream into a relay.
///
/// Implementations must return promptly once `cancel` fires, killing any
/// child process or closing any upstream connection they own.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Pull until the upstream ends or `cancel` fires.
    ///
    /// Returns the number of bytes produced. `Ok(0)` is legal but
    /// suspicious and is logged by the broker.
    async fn pull(&self, cancel: CancellationToken, dest: &mut RelayWriter) -> Result<u64, PullError>;

    /// Short label for logs.
    fn describe(&self) -> String {
        "streamer".to_string()
    }
}

/// How an upstream pull ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The upstream ended on its own after producing data.
    Completed,
    /// The upstream ended without producing anything.
    Empty,
    /// The pull was stopped (last viewer left or shutdown).
    Canceled,
    /// The upstream failed or the streamer panicked.
    Failed,
}

impl PullOutcome {
    /// Classify a finished pull.
    pub fn classify(result: &Result<u64, PullError>, canceled: bool) -> Self {
        match result {
            Ok(0) if !canceled => PullOutcome::Empty,
            Ok(_) if canceled => PullOutcome::Canceled,
            Ok(_) => PullOutcome::Completed,
            Err(PullError::Canceled) => PullOutcome::Canceled,
            // Errors caused by killing the upstream are not failures.
            Err(_) if canceled => PullOutcome::Canceled,
            Err(_) => PullOutcome::Failed,
        }
    }
}

impl fmt::Display for PullOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PullOutcome::Completed => "completed",
            PullOutcome::Empty => "empty",
            PullOutcome::Canceled => "canceled",
            PullOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(PullOutcome::classify(&Ok(10), false), PullOutcome::Completed);
        assert_eq!(PullOutcome::classify(&Ok(0), false), PullOutcome::Empty);
        assert_eq!(PullOutcome::classify(&Ok(10), true), PullOutcome::Canceled);
        assert_eq!(PullOutcome::classify(&Ok(0), true), PullOutcome::Canceled);
        assert_eq!(
            PullOutcome::classify(&Err(PullError::Canceled), false),
            PullOutcome::Canceled
        );
        assert_eq!(
            PullOutcome::classify(&Err(PullError::Upstream("502".into())), false),
            PullOutcome::Failed
        );
        assert_eq!(
            PullOutcome::classify(&Err(PullError::Upstream("killed".into())), true),
            PullOutcome::Canceled
        );
    }
}
