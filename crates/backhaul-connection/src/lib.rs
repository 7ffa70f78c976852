//! Byte-stream plumbing shared by the broker, the agent and the local bridge

pub mod relay;

pub use relay::{relay, spawn_relay, RelayStats, RELAY_BUFFER_SIZE};
