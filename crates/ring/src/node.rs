//! Node identity and lifecycle status.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RingError, RingResult};

/// Opaque, cluster-unique node identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh id for a node listening on `address`.
    ///
    /// The id embeds the address plus instance-local randomness, so a node
    /// restarted on the same address is a different member.
    #[must_use]
    pub fn generate(address: &str) -> Self {
        Self(format!("{address}-{}", Uuid::new_v4().simple()))
    }

    /// Wrap an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a member.
///
/// The declaration order is the precedence used when two views disagree at the
/// same incarnation: a later status always wins.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Contacting seeds, not yet placed on the ring.
    Joining,
    /// Placed on the ring and owning topics.
    Active,
    /// Announced departure, still reachable.
    Leaving,
    /// Gone, either by announcement or by failure detection.
    Departed,
}

impl NodeStatus {
    /// Whether a node with this status holds ring positions.
    #[must_use]
    pub const fn on_ring(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Departed => "departed",
        };
        f.write_str(s)
    }
}

/// A cluster member as seen by the local view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    host: String,
    port: u16,
    status: NodeStatus,
    incarnation: u64,
}

impl Node {
    /// Create a node in the `Joining` state at incarnation zero.
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            status: NodeStatus::Joining,
            incarnation: 0,
        }
    }

    /// Create a node from a `host:port` address.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidAddress`] if the address has no valid port.
    pub fn from_address(id: NodeId, address: &str) -> RingResult<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| RingError::InvalidAddress(address.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| RingError::InvalidAddress(address.to_string()))?;
        Ok(Self::new(id, host, port))
    }

    /// Node id.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// Host the node's ring listener is bound to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the node's ring listener.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of the node's ring listener.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> NodeStatus {
        self.status
    }

    /// Current incarnation.
    #[must_use]
    pub const fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Return a copy with the given status at the same incarnation.
    #[must_use]
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Return a copy with the given incarnation.
    #[must_use]
    pub fn with_incarnation(mut self, incarnation: u64) -> Self {
        self.incarnation = incarnation;
        self
    }

    /// Whether `other` describes a newer state of the same member than `self`.
    ///
    /// Higher incarnation wins, then later status.
    #[must_use]
    pub fn is_superseded_by(&self, other: &Self) -> bool {
        (other.incarnation, other.status) > (self.incarnation, self.status)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = NodeId::generate("127.0.0.1:4000");
        let b = NodeId::generate("127.0.0.1:4000");

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("127.0.0.1:4000-"));
    }

    #[test]
    fn test_from_address() {
        let node = Node::from_address(NodeId::new("a"), "10.0.0.1:7000").unwrap();
        assert_eq!(node.host(), "10.0.0.1");
        assert_eq!(node.port(), 7000);
        assert_eq!(node.address(), "10.0.0.1:7000");
        assert_eq!(node.status(), NodeStatus::Joining);

        assert_matches!(
            Node::from_address(NodeId::new("a"), "nohost"),
            Err(RingError::InvalidAddress(_))
        );
        assert_matches!(
            Node::from_address(NodeId::new("a"), "host:notaport"),
            Err(RingError::InvalidAddress(_))
        );
    }

    #[test]
    fn test_precedence() {
        let base = Node::new(NodeId::new("a"), "h", 1);
        let active = base.clone().with_status(NodeStatus::Active);
        let departed = base.clone().with_status(NodeStatus::Departed);
        let refuted = active.clone().with_incarnation(1);

        assert!(base.is_superseded_by(&active));
        assert!(active.is_superseded_by(&departed));
        assert!(!departed.is_superseded_by(&active));
        assert!(departed.is_superseded_by(&refuted));
        assert!(!active.is_superseded_by(&active));
    }
}
