use ringmq_protocol::CallError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Client errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The broker could not be reached.
    #[error("cannot connect to {address}: {reason}")]
    Connect {
        /// Address dialed.
        address: String,
        /// What went wrong.
        reason: String,
    },

    /// The broker rejected or never acknowledged a call.
    #[error(transparent)]
    Call(#[from] CallError),
}
