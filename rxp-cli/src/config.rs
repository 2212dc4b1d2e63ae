//! Configuration file support for RxP CLI tools

use rxp::RxpConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where to bind and whom to talk to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Local bind address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<SocketAddr>,
    /// Remote address (client only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<SocketAddr>,
    /// Directory files are served from and saved to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

/// Protocol tunables, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_datagram_size: usize,
    pub retry_delay_ms: u64,
    pub send_buffer_size: usize,
    pub window_size: usize,
    pub close_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub inbound_queue: usize,
    pub close_rearm_limit: u32,
    /// Unset means `connect` retries forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let defaults = RxpConfig::default();
        ProtocolConfig {
            max_datagram_size: defaults.max_datagram_size,
            retry_delay_ms: millis(defaults.retry_delay),
            send_buffer_size: defaults.send_buffer_size,
            window_size: defaults.window_size,
            close_timeout_ms: millis(defaults.close_timeout),
            poll_interval_ms: millis(defaults.poll_interval),
            inbound_queue: defaults.inbound_queue,
            close_rearm_limit: defaults.close_rearm_limit,
            connect_timeout_ms: defaults.connect_timeout.map(millis),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ProtocolConfig {
    /// Convert into a validated [`RxpConfig`]
    pub fn to_rxp(&self) -> Result<RxpConfig, ConfigError> {
        let config = RxpConfig {
            max_datagram_size: self.max_datagram_size,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            send_buffer_size: self.send_buffer_size,
            window_size: self.window_size,
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            inbound_queue: self.inbound_queue,
            close_rearm_limit: self.close_rearm_limit,
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Config::default()),
        }
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Example client configuration
    pub fn example_client() -> Self {
        Config {
            endpoint: EndpointConfig {
                bind: Some(SocketAddr::from(([127, 0, 0, 1], 52000))),
                remote: Some(SocketAddr::from(([127, 0, 0, 1], 52001))),
                directory: Some(PathBuf::from("downloads")),
            },
            protocol: ProtocolConfig {
                window_size: 4,
                ..ProtocolConfig::default()
            },
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] rxp::ConfigError),
}
