//! Agent and bridge configuration files (YAML)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Broker control-channel address (host:port)
    pub control_addr: String,

    /// Broker tunnel address (host:port)
    pub tunnel_addr: String,

    /// The private service being exposed (host:port)
    pub service_addr: String,

    /// Tunnels to open before the control channel is established
    #[serde(default)]
    pub initial_tunnels: usize,

    /// Maximum control-channel reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Maximum reconnection delay in seconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,
}

fn default_reconnect_delay() -> u64 {
    1
}

fn default_max_reconnect_delay() -> u64 {
    60
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("control_addr", &self.control_addr),
            ("tunnel_addr", &self.tunnel_addr),
            ("service_addr", &self.service_addr),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", name)));
            }
        }
        if self.reconnect_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_delay_secs must be at least 1".to_string(),
            ));
        }
        if self.max_reconnect_delay_secs < self.reconnect_delay_secs {
            return Err(ConfigError::Invalid(
                "max_reconnect_delay_secs must not be below reconnect_delay_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

/// Local bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Local address to accept connections on
    pub listen_addr: String,

    /// Broker visitor address to forward them to
    pub broker_addr: String,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = read_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() || self.broker_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "listen_addr and broker_addr are required".to_string(),
            ));
        }
        Ok(())
    }
}
