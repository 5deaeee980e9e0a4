//! Error types for the wire protocol.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for framing and decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Result type for a single call on a connection.
pub type CallResult<T> = Result<T, CallError>;

/// Errors that terminate a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length prefix exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame body could not be decoded.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame decoded but violates the protocol.
    #[error("invalid frame: {0}")]
    Invalid(String),

    /// Transport-level failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a failed call. Scoped to the one call; never closes the connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    /// The peer acknowledged with an error.
    #[error("{0}")]
    Remote(String),

    /// The connection closed before the acknowledgement arrived.
    #[error("connection closed before acknowledgement")]
    Closed,

    /// No acknowledgement within the configured window.
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    /// The request was rejected locally before being sent.
    #[error("invalid request: {0}")]
    Invalid(String),
}
