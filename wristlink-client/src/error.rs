//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wristlink_protocol::ProtocolError),

    #[error("engine error: {0}")]
    Core(#[from] wristlink_core::CoreError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    Timeout,

    #[error("supervisor has stopped")]
    SupervisorStopped,

    #[error("device unreachable after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl ClientError {
    /// Returns whether this error is a transport failure that a reconnect
    /// may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let io = ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe",
        ));
        assert!(io.is_retryable());
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::SupervisorStopped.is_retryable());
        assert!(!ClientError::ReconnectExhausted { attempts: 10 }.is_retryable());
    }
}
