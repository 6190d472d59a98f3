//! Web server shared state.

use std::collections::HashMap;
use std::time::Instant;

use tvrelay::{ConcurrencyLimit, LimitStats, StreamBroker, StreamRequest};

use crate::config::{ChannelConfig, ConfigFile};
use crate::streamer::{self, UpstreamError};

/// State shared by all handlers.
pub struct WebState {
    pub broker: StreamBroker,
    /// Channels by name, in configuration order for listings.
    channels: Vec<ChannelConfig>,
    index: HashMap<String, usize>,
    /// Cap on all upstream pulls, if configured.
    global_limit: Option<ConcurrencyLimit>,
    source_limits: HashMap<String, ConcurrencyLimit>,
    http: reqwest::Client,
    pub started_at: Instant,
}

impl WebState {
    /// Build the state from a validated configuration.
    ///
    /// `max_upstreams` of 0 disables the global cap.
    pub fn new(
        broker: StreamBroker,
        config: &ConfigFile,
        max_upstreams: u32,
        http: reqwest::Client,
    ) -> Self {
        let channels = config.channels.clone();
        let index = channels
            .iter()
            .enumerate()
            .map(|(i, channel)| (channel.name.clone(), i))
            .collect();

        let global_limit = (max_upstreams > 0).then(|| ConcurrencyLimit::new("global", max_upstreams));
        let source_limits = config
            .sources
            .iter()
            .map(|source| {
                (
                    source.name.clone(),
                    ConcurrencyLimit::new(source.name.clone(), source.max_streams),
                )
            })
            .collect();

        Self {
            broker,
            channels,
            index,
            global_limit,
            source_limits,
            http,
            started_at: Instant::now(),
        }
    }

    /// Look up a configured channel.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.index.get(name).map(|&i| &self.channels[i])
    }

    /// All configured channels.
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    /// Limits a pull for `channel` has to acquire, global first.
    pub fn limits_for(&self, channel: &ChannelConfig) -> Vec<ConcurrencyLimit> {
        let mut limits = Vec::new();
        if let Some(global) = &self.global_limit {
            limits.push(global.clone());
        }
        if let Some(limit) = channel
            .source
            .as_ref()
            .and_then(|source| self.source_limits.get(source))
        {
            limits.push(limit.clone());
        }
        limits
    }

    /// Build the broker request for a viewer of `name`.
    pub fn request_for(&self, name: &str, query: Option<&str>) -> Result<StreamRequest, UpstreamError> {
        let channel = self
            .channel(name)
            .ok_or_else(|| UpstreamError::UnknownChannel(name.to_string()))?;

        let key = streamer::stream_key(channel, query);
        let producer = streamer::build_streamer(channel, query, &self.http)?;

        let mut request = StreamRequest::new(key, producer);
        request.permits = self.limits_for(channel);
        Ok(request)
    }

    /// Counters of every configured limit.
    pub fn limit_stats(&self) -> Vec<LimitStats> {
        let mut stats: Vec<LimitStats> = self.global_limit.iter().map(|l| l.stats()).collect();
        let mut sources: Vec<LimitStats> = self.source_limits.values().map(|l| l.stats()).collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        stats.extend(sources);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[sources]]
name = "provider-a"
max_streams = 2

[[channels]]
name = "chA"
url = "http://up/chA.ts"
source = "provider-a"

[[channels]]
name = "chB"
url = "http://up/chB.ts"
"#;

    fn state(max_upstreams: u32) -> WebState {
        let config = ConfigFile::parse(CONFIG).unwrap();
        WebState::new(StreamBroker::default(), &config, max_upstreams, reqwest::Client::new())
    }

    #[test]
    fn test_limits_for_channel() {
        let state = state(4);
        let ch_a = state.channel("chA").unwrap().clone();
        let ch_b = state.channel("chB").unwrap().clone();

        let names: Vec<String> = state
            .limits_for(&ch_a)
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(names, vec!["global", "provider-a"]);
        assert_eq!(state.limits_for(&ch_b).len(), 1);
        assert_eq!(state.limit_stats().len(), 2);
    }

    #[test]
    fn test_unlimited_global() {
        let state = state(0);
        let ch_b = state.channel("chB").unwrap().clone();
        assert!(state.limits_for(&ch_b).is_empty());
    }

    #[test]
    fn test_request_for() {
        let state = state(1);
        let request = state.request_for("chA", Some("quality=hd")).unwrap();
        assert_eq!(request.key.as_str(), "http://up/chA.ts?quality=hd");
        assert_eq!(request.permits.len(), 2);

        assert!(matches!(
            state.request_for("nope", None),
            Err(UpstreamError::UnknownChannel(_))
        ));
    }
}
