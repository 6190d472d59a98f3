//! The upstream pull task.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use super::BrokerInner;
use crate::error::PullError;
use crate::key::StreamKey;
use crate::limit::PermitSet;
use crate::relay::StreamRelay;
use crate::streamer::{PullOutcome, Streamer};

/// Run one upstream pull for `relay` until it ends or `scope` is canceled.
///
/// Every exit path retires the relay, releases the permits, withdraws the
/// empty-signal listener, unregisters and closes the relay.
pub(super) async fn run_pull(
    inner: Arc<BrokerInner>,
    key: StreamKey,
    relay: Arc<StreamRelay>,
    streamer: Arc<dyn Streamer>,
    permits: PermitSet,
    scope: CancellationToken,
) -> PullOutcome {
    // Waits for `open` to finish registering the first viewer.
    let subscription = {
        let _guard = inner.locks.lock(&key).await;
        relay.subscribe_empty()
    };
    let listener_id = subscription.id();

    let watcher_scope = scope.clone();
    let watcher_key = key.clone();
    let watcher = tokio::spawn(async move {
        if subscription.fired().await {
            info!("[StreamBroker] Last viewer left {}, stopping upstream", watcher_key);
            watcher_scope.cancel();
        }
    });

    let started = Instant::now();
    let mut writer = relay.writer();
    let result = AssertUnwindSafe(streamer.pull(scope.clone(), &mut writer))
        .catch_unwind()
        .await;
    let canceled = scope.is_cancelled();

    // Nothing may join between the upstream ending and the relay closing.
    relay.retire();
    drop(permits);
    relay.cancel_empty(listener_id);
    watcher.abort();

    {
        let _guard = inner.locks.lock(&key).await;
        inner.registry.remove_if_same(&key, &relay).await;
    }
    relay.close().await;

    let elapsed = started.elapsed();
    let (outcome, result) = match result {
        Ok(result) => (PullOutcome::classify(&result, canceled), result),
        Err(_) => (
            PullOutcome::Failed,
            Err(PullError::Upstream("streamer panicked".to_string())),
        ),
    };

    match (&outcome, &result) {
        (PullOutcome::Completed, Ok(bytes)) => {
            info!(
                "[StreamBroker] Upstream {} completed: {} bytes in {:.1}s",
                key,
                bytes,
                elapsed.as_secs_f64()
            );
        }
        (PullOutcome::Empty, _) => {
            warn!(
                "[StreamBroker] Upstream {} ({}) ended without producing data",
                key,
                streamer.describe()
            );
        }
        (PullOutcome::Canceled, _) => {
            info!(
                "[StreamBroker] Upstream {} canceled after {} bytes ({:.1}s)",
                key,
                writer.bytes_written(),
                elapsed.as_secs_f64()
            );
        }
        (_, Err(e)) => {
            inner.counters.pulls_failed.fetch_add(1, Ordering::Relaxed);
            error!(
                "[StreamBroker] Upstream {} ({}) failed after {} bytes: {}",
                key,
                streamer.describe(),
                writer.bytes_written(),
                e
            );
        }
        (_, Ok(_)) => {}
    }

    outcome
}
