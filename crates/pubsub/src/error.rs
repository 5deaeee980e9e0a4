//! Error types for local publish/subscribe

use thiserror::Error;

/// Result type for local publish/subscribe
pub type PubSubResult<T> = Result<T, PubSubError>;

/// Error reported by a subscriber when acknowledging a message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Create a handler error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Local publish/subscribe errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PubSubError {
    /// Topic is empty or not a valid pattern
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    /// A subscriber acknowledged with an error
    #[error("delivery failed: {0}")]
    Delivery(#[from] HandlerError),
}
