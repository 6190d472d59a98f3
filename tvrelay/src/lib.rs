//! Shared live-stream relaying.
//!
//! Many viewers asking for the same stream share one upstream pull. Bytes
//! produced by the upstream go into a [`StreamRelay`], which keeps a replay
//! window for late joiners and fans every write out to one [`ClientSink`]
//! per viewer. Sinks never block the producer: a viewer that cannot keep up
//! loses its oldest queued data instead.
//!
//! [`StreamBroker`] is the entry point. It keeps at most one relay per
//! [`StreamKey`] in a [`RelayRegistry`], starts the upstream when the first
//! viewer arrives (gated by [`ConcurrencyLimit`]s), and stops it as soon as
//! the last viewer leaves.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::io::AsyncReadExt;
//! use tvrelay::{ConcurrencyLimit, StreamBroker, StreamRequest, Streamer};
//!
//! # async fn example(streamer: Arc<dyn Streamer>) -> Result<(), Box<dyn std::error::Error>> {
//! let broker = StreamBroker::default();
//! let global = ConcurrencyLimit::new("global", 4);
//!
//! let request = StreamRequest::new("http://upstream/chA.ts", streamer).with_limit(global);
//! let mut reader = broker.open(request).await?;
//!
//! let mut buf = vec![0u8; 188 * 64];
//! let n = reader.read(&mut buf).await?;
//! println!("read {} bytes", n);
//!
//! broker.close().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod error;
pub mod key;
pub mod limit;
pub mod registry;
pub mod relay;
pub mod streamer;

pub use broker::{BrokerConfig, BrokerStats, StreamBroker, StreamReader, StreamRequest};
pub use error::{BrokerError, LimitError, PullError, RelayError};
pub use key::StreamKey;
pub use limit::{ConcurrencyLimit, LimitPermit, LimitStats, PermitSet};
pub use registry::RelayRegistry;
pub use relay::{ClientSink, RelayConfig, RelayStats, RelayWriter, StreamRelay};
pub use streamer::{PullOutcome, Streamer};
