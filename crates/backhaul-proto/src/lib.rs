//! Control-channel protocol for the backhaul broker.
//!
//! The control channel is one-directional (broker to agent) and carries
//! newline-terminated ASCII tokens over the same TCP socket the broker uses to
//! detect agent liveness.

pub mod codec;
pub mod signal;

pub use codec::{CodecError, ControlCodec};
pub use signal::ControlSignal;

/// Longest line the decoder buffers before giving up on the peer.
pub const MAX_LINE_LENGTH: usize = 64;

/// Line delimiter for every control token.
pub const TOKEN_DELIMITER: u8 = b'\n';
