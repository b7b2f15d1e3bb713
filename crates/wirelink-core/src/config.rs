//! Channel configuration.
//!
//! Configuration is plain serde data and can be kept in a TOML file.
//! Validation runs on load and again when a channel opens.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wirelink_transport::{TransportConfig, TransportKind};

use crate::transport::TransportPreferences;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Channel configuration
///
/// # Example TOML
///
/// ```toml
/// transports = ["polling", "websocket"]
/// upgrade = true
/// remember_upgrade = false
/// pause_timeout_ms = 1000
/// probe_timeout_ms = 10000
///
/// [transport]
/// host = "localhost"
/// port = 3000
/// secure = false
/// path = "/engine.io/"
/// timestamp_requests = true
/// timestamp_param = "t"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Endpoint and request options shared by every transport
    #[serde(default)]
    pub transport: TransportConfig,

    /// Allowed transports in preference order: "polling", "websocket"
    #[serde(default = "default_transports")]
    pub transports: Vec<String>,

    /// Probe for a websocket upgrade after the handshake
    #[serde(default = "default_upgrade")]
    pub upgrade: bool,

    /// Open directly on websocket when told a previous upgrade succeeded
    #[serde(default)]
    pub remember_upgrade: bool,

    /// Upper bound on waiting for the old transport to pause during an upgrade
    #[serde(default = "default_pause_timeout")]
    pub pause_timeout_ms: u64,

    /// Upper bound on a probe from candidate creation to its PONG
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_transports() -> Vec<String> {
    vec!["polling".to_string(), "websocket".to_string()]
}

fn default_upgrade() -> bool {
    true
}

fn default_pause_timeout() -> u64 {
    1_000
}

fn default_probe_timeout() -> u64 {
    10_000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            transports: default_transports(),
            upgrade: default_upgrade(),
            remember_upgrade: false,
            pause_timeout_ms: default_pause_timeout(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl ChannelConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ChannelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Parsed transport list
    pub fn transport_kinds(&self) -> Result<Vec<TransportKind>, ConfigError> {
        self.transports
            .iter()
            .map(|name| {
                name.parse().map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "Invalid transport '{}'. Valid values: [\"polling\", \"websocket\"]",
                        name
                    ))
                })
            })
            .collect()
    }

    pub fn preferences(&self) -> Result<TransportPreferences, ConfigError> {
        Ok(TransportPreferences {
            transports: self.transport_kinds()?,
            upgrade: self.upgrade,
            remember_upgrade: self.remember_upgrade,
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transports.is_empty() {
            return Err(ConfigError::ValidationError(
                "transports must list at least one transport".to_string(),
            ));
        }
        self.transport_kinds()?;

        if self.transport.port == Some(0) {
            return Err(ConfigError::ValidationError(
                "port must be greater than 0".to_string(),
            ));
        }

        if !self.transport.path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "Invalid path '{}': must start with /",
                self.transport.path
            )));
        }

        if self.transport.host.is_empty() {
            return Err(ConfigError::ValidationError("host must not be empty".to_string()));
        }

        if self.transport.timestamp_requests && self.transport.timestamp_param.is_empty() {
            return Err(ConfigError::ValidationError(
                "timestamp_param must not be empty when timestamp_requests is set".to_string(),
            ));
        }

        for (name, value) in [
            ("pause_timeout_ms", self.pause_timeout_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("transport.request_timeout_ms", self.transport.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }
}
