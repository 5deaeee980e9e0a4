//! The local membership view and its merge rules.

use std::collections::BTreeMap;

use ringmq_ring::{Node, NodeId, NodeStatus};
use tracing::{debug, warn};

use crate::event::MembershipEvent;

#[derive(Clone, Debug)]
struct Member {
    node: Node,
    failures: u32,
}

/// Every member this node knows about, including departed tombstones.
///
/// Two records of the same member are ordered by `(incarnation, status)`; the
/// greater one wins. A node that sees itself reported departed refutes it by
/// bumping its own incarnation.
#[derive(Debug)]
pub struct MemberTable {
    local: NodeId,
    members: BTreeMap<NodeId, Member>,
    had_peers: bool,
    version: u64,
}

impl MemberTable {
    /// Create a table holding only the local node.
    #[must_use]
    pub fn new(local: Node) -> Self {
        let id = local.id().clone();
        let mut members = BTreeMap::new();
        members.insert(
            id.clone(),
            Member {
                node: local,
                failures: 0,
            },
        );
        Self {
            local: id,
            members,
            had_peers: false,
            version: 0,
        }
    }

    /// Local node id.
    #[must_use]
    pub const fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// Local node record.
    #[must_use]
    pub fn local(&self) -> &Node {
        &self.members[&self.local].node
    }

    /// Counter bumped by every modification.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Record of a member.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.members.get(id).map(|m| &m.node)
    }

    /// Full view, tombstones included.
    #[must_use]
    pub fn view(&self) -> Vec<Node> {
        self.members.values().map(|m| m.node.clone()).collect()
    }

    /// Members placed on the ring, the local node included while active.
    #[must_use]
    pub fn active(&self) -> Vec<Node> {
        self.members
            .values()
            .filter(|m| m.node.status().on_ring())
            .map(|m| m.node.clone())
            .collect()
    }

    /// Ids of the members placed on the ring, in id order.
    #[must_use]
    pub fn active_ids(&self) -> Vec<NodeId> {
        self.members
            .values()
            .filter(|m| m.node.status().on_ring())
            .map(|m| m.node.id().clone())
            .collect()
    }

    /// Active members other than the local node.
    #[must_use]
    pub fn peers(&self) -> Vec<Node> {
        self.members
            .values()
            .filter(|m| m.node.id() != &self.local && m.node.status().on_ring())
            .map(|m| m.node.clone())
            .collect()
    }

    /// Admit a joining node as active.
    pub fn admit(&mut self, joiner: Node) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        self.merge_one(joiner.with_status(NodeStatus::Active), &mut events);
        self.check_degraded(&mut events);
        events
    }

    /// Merge a remote view into the local one.
    pub fn merge(&mut self, view: Vec<Node>) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        for node in view {
            self.merge_one(node, &mut events);
        }
        self.check_degraded(&mut events);
        events
    }

    fn merge_one(&mut self, remote: Node, events: &mut Vec<MembershipEvent>) {
        if remote.id() == &self.local {
            self.refute(&remote);
            return;
        }

        match self.members.get_mut(remote.id()) {
            None => {
                debug!("Learned of {} ({})", remote, remote.status());
                if remote.status().on_ring() {
                    events.push(MembershipEvent::NodeJoined(remote.clone()));
                }
                self.members.insert(
                    remote.id().clone(),
                    Member {
                        node: remote,
                        failures: 0,
                    },
                );
                self.version += 1;
            }
            Some(member) if member.node.is_superseded_by(&remote) => {
                let was_on_ring = member.node.status().on_ring();
                let is_on_ring = remote.status().on_ring();

                match (was_on_ring, is_on_ring) {
                    (false, true) => events.push(MembershipEvent::NodeJoined(remote.clone())),
                    (true, false) => events.push(MembershipEvent::NodeLeft(remote.id().clone())),
                    _ => {}
                }

                member.node = remote;
                member.failures = 0;
                self.version += 1;
            }
            Some(_) => {}
        }
    }

    fn refute(&mut self, remote: &Node) {
        let Some(local) = self.members.get_mut(&self.local) else {
            return;
        };
        if local.node.status() != NodeStatus::Active {
            return;
        }
        if remote.status() > NodeStatus::Active && remote.incarnation() >= local.node.incarnation()
        {
            let incarnation = remote.incarnation() + 1;
            warn!(
                "Refuting report that local node is {}; incarnation now {}",
                remote.status(),
                incarnation
            );
            local.node = local.node.clone().with_incarnation(incarnation);
            self.version += 1;
        }
    }

    /// Count a failed sync round against a peer.
    ///
    /// The first failure suspects the peer; reaching `threshold` consecutive
    /// failures marks it departed.
    pub fn record_failure(&mut self, id: &NodeId, threshold: u32) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        let Some(member) = self.members.get_mut(id) else {
            return events;
        };
        if id == &self.local || !member.node.status().on_ring() {
            return events;
        }

        member.failures += 1;
        if member.failures == 1 {
            events.push(MembershipEvent::NodeSuspected(id.clone()));
        }
        if member.failures >= threshold.max(1) {
            member.node = member.node.clone().with_status(NodeStatus::Departed);
            self.version += 1;
            events.push(MembershipEvent::NodeFailed(id.clone()));
        }

        self.check_degraded(&mut events);
        events
    }

    /// Clear the failure count of a peer that answered.
    pub fn record_success(&mut self, id: &NodeId) -> Option<MembershipEvent> {
        let member = self.members.get_mut(id)?;
        if member.failures == 0 {
            return None;
        }
        member.failures = 0;
        member
            .node
            .status()
            .on_ring()
            .then(|| MembershipEvent::NodeRecovered(id.clone()))
    }

    /// Mark the local node departed and return its final record.
    pub fn depart_local(&mut self) -> Node {
        if let Some(local) = self.members.get_mut(&self.local) {
            local.node = local.node.clone().with_status(NodeStatus::Departed);
        }
        self.version += 1;
        self.local().clone()
    }

    fn check_degraded(&mut self, events: &mut Vec<MembershipEvent>) {
        let has_peers = self
            .members
            .values()
            .any(|m| m.node.id() != &self.local && m.node.status().on_ring());

        if has_peers {
            self.had_peers = true;
        } else if self.had_peers && self.local().status().on_ring() {
            self.had_peers = false;
            events.push(MembershipEvent::Degraded);
        }
    }
}
