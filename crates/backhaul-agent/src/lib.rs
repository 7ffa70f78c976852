//! Private-side collaborators of the broker
//!
//! The [`Agent`] runs next to the private service: it keeps a control channel
//! open to the broker and opens tunnel connections when asked. The
//! [`LocalBridge`] is the visitor-side helper that forwards a local port to the
//! broker's public address.

pub mod agent;
pub mod bridge;
pub mod config;

pub use agent::{Agent, AgentError};
pub use bridge::LocalBridge;
pub use config::{AgentConfig, BridgeConfig, ConfigError};
