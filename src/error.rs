use crate::packet::MAX_PACKET_SIZE;
use thiserror::Error;

/// Central error type for all fallible Parlo operations.
///
/// Faults that occur inside background tasks (receive loop, heartbeat loops,
/// packet reassembly) are not returned to callers - they are logged and
/// surfaced through the `on_connection_lost` handler of the affected
/// connection. Everything else propagates synchronously at the API boundary.
#[derive(Error, Debug)]
pub enum ParloError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("input of {size} bytes exceeds the maximum of {max}")]
    Overflow { size: usize, max: usize },

    #[error("not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unsupported cipher mode: {0}")]
    UnsupportedCipher(String),
}

impl ParloError {
    /// Shorthand for the most common overflow case, an input that is bigger
    /// than a single packet.
    pub(crate) fn packet_overflow(size: usize) -> ParloError {
        ParloError::Overflow { size, max: MAX_PACKET_SIZE }
    }
}

pub type Result<T> = std::result::Result<T, ParloError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ParloError::Overflow { size: 1025, max: 1024 }.to_string(),
            "input of 1025 bytes exceeds the maximum of 1024",
        );
        assert_eq!(ParloError::NotConnected.to_string(), "not connected");
        assert_eq!(
            ParloError::UnsupportedCipher("rot13".to_string()).to_string(),
            "unsupported cipher mode: rot13",
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ParloError = io_err.into();
        assert!(matches!(err, ParloError::Transport(_)));
    }
}
