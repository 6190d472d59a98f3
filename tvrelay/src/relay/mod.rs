//! Stream relays: fan-out of one upstream to many viewers.

mod replay;
mod sink;
mod stream;
mod writer;

pub use replay::{ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
pub use sink::{ClientSink, SinkId, DEFAULT_QUEUE_DEPTH};
pub use stream::{EmptySubscription, RelayConfig, RelayStats, StreamRelay};
pub use writer::RelayWriter;
