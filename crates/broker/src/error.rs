use std::time::Duration;

use ringmq_membership::MembershipError;
use ringmq_protocol::CallError;
use ringmq_pubsub::PubSubError;
use thiserror::Error;

use crate::broker::BrokerState;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid or missing startup parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No seed admitted this node in time.
    #[error("ring join timed out after {0:?}")]
    RingJoinTimeout(Duration),

    /// A peer sent a malformed frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A message could not be delivered to every subscriber.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Transport-level failure talking to a peer.
    #[error("connection to {address} failed: {reason}")]
    Connection {
        /// Address that was dialed.
        address: String,
        /// What went wrong.
        reason: String,
    },

    /// Lifecycle operation not allowed in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// State the broker was in.
        state: BrokerState,
    },

    /// Socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Text carried by a failed acknowledgement. Delivery errors travel as
    /// their bare reason so forwarding nodes do not stack prefixes.
    pub(crate) fn into_ack(self) -> String {
        match self {
            Self::Delivery(reason) => reason,
            other => other.to_string(),
        }
    }
}

impl From<MembershipError> for BrokerError {
    fn from(error: MembershipError) -> Self {
        match error {
            MembershipError::JoinTimeout(timeout) => Self::RingJoinTimeout(timeout),
            other => Self::Delivery(other.to_string()),
        }
    }
}

impl From<PubSubError> for BrokerError {
    fn from(error: PubSubError) -> Self {
        match error {
            PubSubError::Delivery(handler) => Self::Delivery(handler.message().to_string()),
            other => Self::Delivery(other.to_string()),
        }
    }
}

impl From<CallError> for BrokerError {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Remote(message) => Self::Delivery(message),
            CallError::Invalid(message) => Self::Protocol(message),
            other => Self::Delivery(other.to_string()),
        }
    }
}
