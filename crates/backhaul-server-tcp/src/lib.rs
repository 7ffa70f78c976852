//! TCP listeners for the broker
//!
//! Three thin accept loops: agent control channels go to the agent registry,
//! agent tunnels go to the tunnel pool, and visitors are paired with a tunnel
//! on arrival.

mod listener;
mod visitor;

pub use listener::{bind_listener, ControlListener, ServerError, TunnelListener};
pub use visitor::{DrainPolicy, VisitorAcceptor, VisitorOutcome, VisitorPairing, VisitorStats};
