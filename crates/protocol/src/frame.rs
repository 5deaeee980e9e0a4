//! Frame model.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// Discriminates what a frame asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Publish a message to a topic.
    Publish,
    /// Deliver a message to a subscriber; never re-routed by the receiver.
    Deliver,
    /// Register a subscription.
    Subscribe,
    /// Remove a subscription.
    Unsubscribe,
    /// Acknowledge a request with the same correlation id.
    Ack,
    /// Ask a member to admit the sender to the ring.
    Join,
    /// Exchange membership views.
    Sync,
    /// Announce departure from the ring.
    Leave,
}

impl FrameKind {
    /// Whether this kind expects an `Ack`.
    #[must_use]
    pub const fn is_request(self) -> bool {
        !matches!(self, Self::Ack)
    }

    /// Whether frames of this kind must name a topic.
    #[must_use]
    pub const fn requires_topic(self) -> bool {
        matches!(
            self,
            Self::Publish | Self::Deliver | Self::Subscribe | Self::Unsubscribe
        )
    }
}

/// A single protocol frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Call kind.
    pub kind: FrameKind,
    /// Correlation id, echoed by the `Ack`.
    pub correlation_id: u64,
    /// Topic; empty for membership and ack frames.
    #[serde(default)]
    pub topic: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Bytes,
    /// Node id of the broker that forwarded this request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Error carried by a failed `Ack`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    /// Build a request. The correlation id is assigned when the frame is sent.
    pub fn request(kind: FrameKind, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            correlation_id: 0,
            topic: topic.into(),
            payload: payload.into(),
            origin: None,
            error: None,
        }
    }

    /// Build the acknowledgement for `correlation_id`.
    #[must_use]
    pub fn ack(correlation_id: u64, result: Result<Bytes, String>) -> Self {
        let (payload, error) = match result {
            Ok(payload) => (payload, None),
            Err(error) => (Bytes::new(), Some(error)),
        };
        Self {
            kind: FrameKind::Ack,
            correlation_id,
            topic: String::new(),
            payload,
            origin: None,
            error,
        }
    }

    /// Set the origin node id.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Check the frame against protocol rules.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] when a topic-bearing request has an
    /// empty topic, or when a request carries an error field.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.kind.requires_topic() && self.topic.is_empty() {
            return Err(ProtocolError::Invalid(format!(
                "{:?} frame {} has no topic",
                self.kind, self.correlation_id
            )));
        }
        if self.kind.is_request() && self.error.is_some() {
            return Err(ProtocolError::Invalid(format!(
                "{:?} frame {} carries an error",
                self.kind, self.correlation_id
            )));
        }
        Ok(())
    }

    /// Encode the frame body as CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if serialization fails.
    pub fn to_cbor(&self) -> ProtocolResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(self, &mut body)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(body)
    }

    /// Decode a frame body from CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the body is not a valid frame.
    pub fn from_cbor(body: &[u8]) -> ProtocolResult<Self> {
        ciborium::de::from_reader(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
