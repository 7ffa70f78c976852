//! Newline-delimited codec for control signals

use crate::{ControlSignal, MAX_LINE_LENGTH, TOKEN_DELIMITER};
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control line too long: {0} bytes buffered without a delimiter")]
    LineTooLong(usize),
}

/// Control-channel codec.
///
/// Format: `TOKEN\n`. The decoder tolerates tokens split across reads,
/// a trailing `\r`, blank lines, and unknown tokens (skipped with a warning).
#[derive(Debug, Default)]
pub struct ControlCodec {
    /// Bytes of the buffer already searched for a delimiter.
    scanned: usize,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlSignal;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlSignal>, CodecError> {
        loop {
            let delimiter = src[self.scanned..]
                .iter()
                .position(|b| *b == TOKEN_DELIMITER);

            let Some(offset) = delimiter else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong(src.len()));
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let line = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            let mut token = &line[..line.len() - 1];
            if let Some(stripped) = token.strip_suffix(b"\r") {
                token = stripped;
            }
            if token.is_empty() {
                continue;
            }

            match ControlSignal::from_token(token) {
                Some(signal) => return Ok(Some(signal)),
                None => {
                    tracing::warn!(
                        token = %String::from_utf8_lossy(token),
                        "Skipping unknown control token"
                    );
                }
            }
        }
    }
}

impl Encoder<ControlSignal> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, signal: ControlSignal, dst: &mut BytesMut) -> Result<(), CodecError> {
        let token = signal.token();
        dst.reserve(token.len() + 1);
        dst.put_slice(token.as_bytes());
        dst.put_u8(TOKEN_DELIMITER);
        Ok(())
    }
}
