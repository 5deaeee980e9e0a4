//! Error types for ring operations

use thiserror::Error;

/// Result type for ring operations
pub type RingResult<T> = Result<T, RingError>;

/// Ring-related errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The ring has no positions, so nothing can own a topic
    #[error("ring is empty")]
    Empty,

    /// Topics must be non-empty strings
    #[error("topic must not be empty")]
    EmptyTopic,

    /// A node address could not be parsed as `host:port`
    #[error("invalid node address '{0}'")]
    InvalidAddress(String),
}
