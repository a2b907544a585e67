//! Core error types.

use thiserror::Error;
use wristlink_protocol::ProtocolError;

/// Errors from the transfer engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("an install is already in progress")]
    InstallInProgress,

    #[error("install has no installables")]
    EmptyInstall,

    #[error("installable not found: {name}")]
    InstallableNotFound { name: String },

    #[error("CRC32C mismatch for {name}: expected {expected:#010x}, actual {actual:#010x}")]
    Crc32cMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("no free slot on device")]
    NoFreeSlot,

    #[error("upload rejected by device (command {command})")]
    UploadRejected { command: u8 },

    #[error("timed out waiting for an upload token")]
    TokenTimeout,

    #[error("datalog batch of {len} bytes is not a multiple of item size {item_size}")]
    MalformedBatch { len: usize, item_size: u16 },

    #[error("unsupported record version {version} for tag {tag}")]
    UnsupportedRecordVersion { tag: i32, version: u16 },

    #[error("sample store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CoreError {
    /// Returns whether the operation may succeed if repeated. For datalog
    /// batches this is what the device does on a NACK.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::StoreUnavailable { .. } | CoreError::Io(_))
    }

    /// Short, stable label used in install failure events.
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::InstallInProgress => "INSTALL_IN_PROGRESS",
            CoreError::EmptyInstall => "EMPTY_INSTALL",
            CoreError::InstallableNotFound { .. } => "INSTALLABLE_NOT_FOUND",
            CoreError::Crc32cMismatch { .. } => "CRC_MISMATCH",
            CoreError::NoFreeSlot => "NO_FREE_SLOT",
            CoreError::UploadRejected { .. } => "UPLOAD_REJECTED",
            CoreError::TokenTimeout => "TOKEN_TIMEOUT",
            CoreError::MalformedBatch { .. } => "MALFORMED_BATCH",
            CoreError::UnsupportedRecordVersion { .. } => "UNSUPPORTED_VERSION",
            CoreError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Protocol(_) => "PROTOCOL_ERROR",
        }
    }
}
