use ringmq_ring::{Node, NodeId};

/// Membership change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node was placed on the ring.
    NodeJoined(Node),
    /// A node announced its departure.
    NodeLeft(NodeId),
    /// A node missed a sync round.
    NodeSuspected(NodeId),
    /// A suspected node answered again.
    NodeRecovered(NodeId),
    /// A node missed enough sync rounds to be removed from the ring.
    NodeFailed(NodeId),
    /// Every peer is gone; this node now owns the whole ring.
    Degraded,
}
