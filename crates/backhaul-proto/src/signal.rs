//! Control signals sent from the broker to an agent

use std::fmt;

/// A single control-channel token.
///
/// There is no acknowledgement: the broker writes a signal and moves on, and
/// a failed write is the only disconnect indication it gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// Liveness check, ignored by the agent.
    KeepAlive,
    /// Ask the agent to open one more tunnel connection.
    NewTunnel,
}

impl ControlSignal {
    /// Wire token without the trailing delimiter.
    pub const fn token(self) -> &'static str {
        match self {
            ControlSignal::KeepAlive => "KEEP_ALIVE",
            ControlSignal::NewTunnel => "NEW_CONNECTION",
        }
    }

    /// Parse a token (delimiter already stripped).
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"KEEP_ALIVE" => Some(ControlSignal::KeepAlive),
            b"NEW_CONNECTION" => Some(ControlSignal::NewTunnel),
            _ => None,
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}
