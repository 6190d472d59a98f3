//! Configuration file format and validation.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tvrelay::{BrokerConfig, RelayConfig};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "tvrelay.toml";

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8089";

/// Errors from loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid listen address {0:?}")]
    InvalidListen(String),

    #[error("Duplicate channel name: {0}")]
    DuplicateChannel(String),

    #[error("Duplicate source name: {0}")]
    DuplicateSource(String),

    #[error("Channel {0} has an empty url")]
    EmptyUrl(String),

    #[error("Channel {0} has an empty command")]
    EmptyCommand(String),

    #[error("Channel {channel} references unknown source {name}")]
    UnknownSource { channel: String, name: String },

    #[error("Source {0} must allow at least one stream")]
    ZeroCapacity(String),

    #[error("Invalid value for broker.{field}: {value}")]
    InvalidSize { field: &'static str, value: usize },
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BrokerSection {
    /// Global cap on concurrent upstream pulls; 0 means unlimited.
    pub max_upstreams: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
    pub replay_buffer_mib: Option<usize>,
    pub client_queue_depth: Option<usize>,
    pub pipe_capacity_kib: Option<usize>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// A subscription with its own stream cap.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    pub max_streams: u32,
}

/// One channel served under `/stream/{name}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Upstream URL; also the identity of the shared stream.
    pub url: String,
    #[serde(default)]
    pub source: Option<String>,
    /// Command producing the stream on stdout; `{url}` is substituted.
    /// Without a command the url is fetched over HTTP.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl ConfigFile {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parse and validate config text.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: ConfigFile = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references and required values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(listen) = &self.server.listen {
            listen
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;
        }

        self.broker.replay_capacity()?;
        self.broker.pipe_capacity()?;

        let mut sources = HashSet::new();
        for source in &self.sources {
            if !sources.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            if source.max_streams == 0 {
                return Err(ConfigError::ZeroCapacity(source.name.clone()));
            }
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(ConfigError::DuplicateChannel(channel.name.clone()));
            }
            if channel.url.trim().is_empty() {
                return Err(ConfigError::EmptyUrl(channel.name.clone()));
            }
            if let Some(command) = &channel.command {
                if command.first().map_or(true, |program| program.trim().is_empty()) {
                    return Err(ConfigError::EmptyCommand(channel.name.clone()));
                }
            }
            if let Some(source) = &channel.source {
                if !sources.contains(source.as_str()) {
                    return Err(ConfigError::UnknownSource {
                        channel: channel.name.clone(),
                        name: source.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl BrokerSection {
    /// Replay buffer size in bytes, if configured.
    fn replay_capacity(&self) -> Result<Option<usize>, ConfigError> {
        self.replay_buffer_mib
            .map(|mib| {
                mib.checked_mul(1024 * 1024).ok_or(ConfigError::InvalidSize {
                    field: "replay_buffer_mib",
                    value: mib,
                })
            })
            .transpose()
    }

    /// Viewer pipe size in bytes, if configured. Must be non-zero.
    fn pipe_capacity(&self) -> Result<Option<usize>, ConfigError> {
        self.pipe_capacity_kib
            .map(|kib| match kib.checked_mul(1024) {
                Some(bytes) if bytes > 0 => Ok(bytes),
                _ => Err(ConfigError::InvalidSize {
                    field: "pipe_capacity_kib",
                    value: kib,
                }),
            })
            .transpose()
    }

    /// Broker settings with defaults filled in.
    ///
    /// Sizes rejected by [`ConfigFile::validate`] fall back to the defaults.
    pub fn broker_config(&self) -> BrokerConfig {
        let defaults = BrokerConfig::default();
        let relay_defaults = RelayConfig::default();

        BrokerConfig {
            relay: RelayConfig {
                replay_capacity: self
                    .replay_capacity()
                    .ok()
                    .flatten()
                    .unwrap_or(relay_defaults.replay_capacity),
                queue_depth: self.client_queue_depth.unwrap_or(relay_defaults.queue_depth),
                close_grace: relay_defaults.close_grace,
            },
            acquire_timeout: self
                .acquire_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            pipe_capacity: self
                .pipe_capacity()
                .ok()
                .flatten()
                .unwrap_or(defaults.pipe_capacity),
        }
    }

    /// Interval between idle-relay sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.unwrap_or(60).max(1))
    }
}
