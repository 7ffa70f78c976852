//! Broker configuration (YAML)
//!
//! Loaded once at startup and immutable afterwards.

use backhaul_server_tcp::DrainPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Agent control-channel listener
    #[serde(default = "default_agent_addr")]
    pub agent_addr: SocketAddr,

    /// Agent tunnel listener
    #[serde(default = "default_tunnel_addr")]
    pub tunnel_addr: SocketAddr,

    /// Public visitor listener
    #[serde(default = "default_visitor_addr")]
    pub visitor_addr: SocketAddr,

    /// Maximum concurrently bound agents
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    /// Idle tunnels the monitor tries to keep in the pool
    #[serde(default = "default_target_idle_tunnels")]
    pub target_idle_tunnels: usize,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Deadline for a single keepalive or notify write
    #[serde(default = "default_keepalive_write_timeout")]
    pub keepalive_write_timeout_ms: u64,

    #[serde(default)]
    pub drain: DrainConfig,

    /// How long in-flight relays may run after shutdown starts
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Stray-byte drain of claimed tunnels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    #[serde(default = "default_drain_enabled")]
    pub enabled: bool,

    #[serde(default = "default_drain_deadline")]
    pub deadline_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            enabled: default_drain_enabled(),
            deadline_ms: default_drain_deadline(),
        }
    }
}

fn default_agent_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8009))
}

fn default_tunnel_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8008))
}

fn default_visitor_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_agents() -> usize {
    16
}

fn default_target_idle_tunnels() -> usize {
    4
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_monitor_interval() -> u64 {
    2
}

fn default_keepalive_write_timeout() -> u64 {
    1000
}

fn default_drain_enabled() -> bool {
    true
}

fn default_drain_deadline() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            agent_addr: default_agent_addr(),
            tunnel_addr: default_tunnel_addr(),
            visitor_addr: default_visitor_addr(),
            max_agents: default_max_agents(),
            target_idle_tunnels: default_target_idle_tunnels(),
            keepalive_interval_secs: default_keepalive_interval(),
            monitor_interval_secs: default_monitor_interval(),
            keepalive_write_timeout_ms: default_keepalive_write_timeout(),
            drain: DrainConfig::default(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl BrokerConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_agents == 0 {
            return Err(ConfigError::Invalid(
                "max_agents must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
            ("keepalive_write_timeout_ms", self.keepalive_write_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }

        if self.drain.enabled && self.drain.deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "drain.deadline_ms must be non-zero when drain is enabled".to_string(),
            ));
        }

        let addrs = [self.agent_addr, self.tunnel_addr, self.visitor_addr];
        for (i, a) in addrs.iter().enumerate() {
            // Port 0 picks an ephemeral port, so it never collides.
            if a.port() != 0 && addrs[i + 1..].contains(a) {
                return Err(ConfigError::Invalid(format!(
                    "listener address {} is used more than once",
                    a
                )));
            }
        }

        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn keepalive_write_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        DrainPolicy {
            enabled: self.drain.enabled,
            deadline: Duration::from_millis(self.drain.deadline_ms),
        }
    }
}
