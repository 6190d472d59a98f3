//! Producer-side handle for a relay.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use crate::relay::stream::StreamRelay;

/// Writes upstream bytes into a [`StreamRelay`].
///
/// Writes complete immediately: the relay fans out into per-viewer queues
/// and never waits for a viewer.
pub struct RelayWriter {
    relay: Arc<StreamRelay>,
    written: u64,
}

impl RelayWriter {
    pub(crate) fn new(relay: Arc<StreamRelay>) -> Self {
        Self { relay, written: 0 }
    }

    /// Synchronous write, for producers that already hold the data.
    pub fn write_chunk(&mut self, data: &[u8]) -> usize {
        let n = self.relay.write(data);
        self.written += n as u64;
        n
    }

    /// Bytes written through this handle.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl AsyncWrite for RelayWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(self.get_mut().write_chunk(buf)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
