//! Transport layer error types.
//!
//! These never reach the caller directly. Channel attempts log them and the
//! connection maps the ones that matter into [`Error`](crate::Error).

use std::io;

use thiserror::Error;

use super::frame::FrameError;
use crate::core::Error;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Frame parsing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The endpoint could not be resolved or reached.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The peer answered but the handshake did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer speaks a protocol version we do not.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The relay refused the session.
    #[error("relay rejected the session: {0}")]
    RelayRejected(String),

    /// The attempt timed out.
    #[error("timed out")]
    Timeout,

    /// The link is closed.
    #[error("link closed")]
    Closed,
}

impl TransportError {
    /// Whether the error ends the link it occurred on.
    ///
    /// A malformed datagram is dropped and the link keeps going.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Frame(_))
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Error::Timeout,
            TransportError::Closed => Error::Aborted,
            TransportError::Unreachable(_) => Error::NotFound,
            _ => Error::Unknown,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::Closed.is_fatal());
        assert!(TransportError::Timeout.is_fatal());
        assert!(TransportError::Io(io::Error::other("test")).is_fatal());
        assert!(!TransportError::Frame(FrameError::InvalidType(0xEE)).is_fatal());
    }

    #[test]
    fn test_public_mapping() {
        assert_eq!(Error::from(TransportError::Timeout), Error::Timeout);
        assert_eq!(Error::from(TransportError::Closed), Error::Aborted);
        assert_eq!(
            Error::from(TransportError::Unreachable("nowhere:1".into())),
            Error::NotFound
        );
        assert_eq!(
            Error::from(TransportError::HandshakeFailed("bad hello".into())),
            Error::Unknown
        );
    }
}
