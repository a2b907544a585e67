//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("dict has too many entries: {0} (max 255)")]
    DictTooLarge(usize),

    #[error("value too long for key {key}: {len} bytes")]
    ValueTooLong { key: i32, len: usize },

    #[error("unknown command {command:#04x} on endpoint {endpoint:#06x}")]
    UnknownCommand { endpoint: u16, command: u8 },

    #[error("bad checksum: expected {expected:#04x}, got {actual:#04x}")]
    BadChecksum { expected: u8, actual: u8 },

    #[error("payload length mismatch: header says {declared}, packet carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid escape sequence at end of packet")]
    InvalidEscape,

    #[error("invalid dict JSON: {0}")]
    InvalidDictJson(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Returns whether the error is handled inside the codec by skipping
    /// or resynchronizing, rather than surfacing to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::Truncated { .. }
                | ProtocolError::UnknownCommand { .. }
                | ProtocolError::BadChecksum { .. }
                | ProtocolError::LengthMismatch { .. }
                | ProtocolError::InvalidEscape
        )
    }
}

/// Fails with [`ProtocolError::Truncated`] unless `buf` holds at least `needed` bytes.
pub(crate) fn ensure(buf: &[u8], needed: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            what,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}
