//! Concrete upstream producers.

mod command;
mod http;

use std::sync::Arc;

use tvrelay::{StreamKey, Streamer};

use crate::config::ChannelConfig;

pub use command::CommandStreamer;
pub use http::HttpStreamer;

/// Errors resolving a request to an upstream.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel {0} has an empty command")]
    EmptyCommand(String),
}

/// Read size for upstream sources; a multiple of the 188-byte TS packet.
pub(crate) const READ_CHUNK: usize = 188 * 256;

/// Upstream URL for a channel request, with the request query appended.
pub fn upstream_url(base: &str, query: Option<&str>) -> String {
    match query.map(|q| q.trim().trim_start_matches('?')).filter(|q| !q.is_empty()) {
        Some(q) if base.contains('?') => format!("{}&{}", base, q),
        Some(q) => format!("{}?{}", base, q),
        None => base.to_string(),
    }
}

/// Stream key for a channel request.
pub fn stream_key(channel: &ChannelConfig, query: Option<&str>) -> StreamKey {
    StreamKey::from_parts(&channel.url, query)
}

/// Build the producer for a channel request.
pub fn build_streamer(
    channel: &ChannelConfig,
    query: Option<&str>,
    client: &reqwest::Client,
) -> Result<Arc<dyn Streamer>, UpstreamError> {
    let url = upstream_url(&channel.url, query);
    match &channel.command {
        Some(template) => {
            let streamer = CommandStreamer::from_template(template, &url)
                .ok_or_else(|| UpstreamError::EmptyCommand(channel.name.clone()))?;
            Ok(Arc::new(streamer))
        }
        None => Ok(Arc::new(HttpStreamer::new(
            client.clone(),
            url,
            channel.user_agent.clone(),
        ))),
    }
}
