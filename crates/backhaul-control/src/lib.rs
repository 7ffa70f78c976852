//! Broker-side tunnel matching and lifecycle engine
//!
//! Shared state lives here: the pool of idle tunnel connections, the registry
//! of bound agent control channels, the deficit-driven replenishment monitor,
//! and the tracker for in-flight relays.
pub mod agent_registry;
pub mod monitor;
pub mod shutdown;
pub mod task_tracker;
pub mod tunnel_pool;

pub use agent_registry::{
    AgentConnection, AgentRegistry, AgentRegistryConfig, KeepaliveOutcome, KeepaliveRecord,
    NotifyOutcome, SignalError,
};
pub use monitor::ReplenishmentMonitor;
pub use shutdown::shutdown_requested;
pub use task_tracker::RelayTracker;
pub use tunnel_pool::{DrainOutcome, TunnelConnection, TunnelPool};
