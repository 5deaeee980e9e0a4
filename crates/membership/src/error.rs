//! Error types for ring membership

use std::time::Duration;

use ringmq_ring::RingError;
use thiserror::Error;

/// Result type for membership operations
pub type MembershipResult<T> = Result<T, MembershipError>;

/// Membership errors
#[derive(Clone, Debug, Error)]
pub enum MembershipError {
    /// No seed admitted this node in time
    #[error("no seed responded within {0:?}")]
    JoinTimeout(Duration),

    /// A membership payload could not be decoded
    #[error("invalid membership payload: {0}")]
    Decode(String),

    /// Ring lookup failed
    #[error(transparent)]
    Ring(#[from] RingError),

    /// The node has left the ring
    #[error("membership is shut down")]
    ShutDown,
}
