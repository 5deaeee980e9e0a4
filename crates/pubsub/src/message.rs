use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message published to a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message was published to.
    pub topic: String,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Message {
    /// Create a message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}
