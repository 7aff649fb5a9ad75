//! Error types for edgelink.
//!
//! [`Error`] is the single public error kind surfaced through every
//! synchronous call and every [`Completion`](crate::completion::Completion).
//! Layer-internal errors convert into it at the public boundary.

use thiserror::Error;

/// Public error kinds.
///
/// Every kind is consumable both as a symbolic code ([`Error::code`]) and as a
/// human-readable message (`Display` / [`Error::message`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// Operation is not legal in the current lifecycle phase, or required
    /// configuration is missing.
    #[error("operation not allowed in the current state")]
    InvalidState,

    /// An argument was malformed or not recognized.
    #[error("invalid argument")]
    InvalidArgument,

    /// Another operation of the same kind is still outstanding.
    #[error("an operation of this kind is already in progress")]
    OperationInProgress,

    /// No channel to the device could be established.
    #[error("no channels could be established to the device")]
    NoChannels,

    /// The connection is not connected.
    #[error("not connected")]
    NotConnected,

    /// A lookup found nothing.
    #[error("not found")]
    NotFound,

    /// The peer closed the stream, no more bytes will arrive.
    #[error("end of file")]
    Eof,

    /// The operation was forcibly terminated.
    #[error("operation aborted")]
    Aborted,

    /// The client was stopped.
    #[error("client stopped")]
    Stopped,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An optional value is absent.
    #[error("no data")]
    NoData,

    /// The peer sent a response that could not be decoded.
    #[error("bad response from peer")]
    BadResponse,

    /// The feature is not implemented.
    #[error("not implemented")]
    NotImplemented,

    /// Unclassified failure in an underlying collaborator.
    #[error("unknown error")]
    Unknown,
}

impl Error {
    /// Every error kind, in declaration order.
    pub const ALL: [Error; 14] = [
        Error::InvalidState,
        Error::InvalidArgument,
        Error::OperationInProgress,
        Error::NoChannels,
        Error::NotConnected,
        Error::NotFound,
        Error::Eof,
        Error::Aborted,
        Error::Stopped,
        Error::Timeout,
        Error::NoData,
        Error::BadResponse,
        Error::NotImplemented,
        Error::Unknown,
    ];

    /// Symbolic code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidState => "INVALID_STATE",
            Error::InvalidArgument => "INVALID_ARGUMENT",
            Error::OperationInProgress => "OPERATION_IN_PROGRESS",
            Error::NoChannels => "NO_CHANNELS",
            Error::NotConnected => "NOT_CONNECTED",
            Error::NotFound => "NOT_FOUND",
            Error::Eof => "EOF",
            Error::Aborted => "ABORTED",
            Error::Stopped => "STOPPED",
            Error::Timeout => "TIMEOUT",
            Error::NoData => "NO_DATA",
            Error::BadResponse => "BAD_RESPONSE",
            Error::NotImplemented => "NOT_IMPLEMENTED",
            Error::Unknown => "UNKNOWN",
        }
    }

    /// Human-readable description of this error kind.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Look up an error kind by its symbolic code.
    pub fn from_code(code: &str) -> Option<Error> {
        Error::ALL.into_iter().find(|e| e.code() == code)
    }
}

/// Result alias used across the public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Symbolic code for an operation outcome, `"OK"` for success.
pub fn outcome_code(outcome: &Result<()>) -> &'static str {
    match outcome {
        Ok(()) => "OK",
        Err(e) => e.code(),
    }
}
