//! Backhaul - reverse tunnel broker
//!
//! Exposes a private TCP service through a public broker without any inbound
//! connection to the private network. Agents running next to the service dial
//! out to the broker and keep a pool of idle tunnel connections there; each
//! public visitor is paired with one idle tunnel and the two sockets are
//! relayed byte for byte.
//!
//! # Running a broker
//!
//! ```ignore
//! use backhaul_lib::{Broker, BrokerConfig};
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::load("broker.yaml".as_ref())?;
//! let broker = Broker::bind(config).await?;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown_tx.send_replace(true);
//! });
//!
//! let stats = broker.run(shutdown_rx).await;
//! println!("paired {} visitors", stats.visitors_paired);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;

pub use broker::{Broker, BrokerAddrs, BrokerError, BrokerHandle, BrokerStats};
pub use config::{BrokerConfig, ConfigError, DrainConfig};

// Re-export the building blocks
pub use backhaul_agent::{Agent, AgentConfig, AgentError, BridgeConfig, LocalBridge};
pub use backhaul_connection::{relay, spawn_relay, RelayStats};
pub use backhaul_control::{
    AgentRegistry, AgentRegistryConfig, NotifyOutcome, RelayTracker, ReplenishmentMonitor,
    TunnelPool,
};
pub use backhaul_proto::{ControlCodec, ControlSignal};
pub use backhaul_server_tcp::{DrainPolicy, ServerError, VisitorOutcome};
