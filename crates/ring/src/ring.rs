//! The ring of virtual positions.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{RingError, RingResult};
use crate::hasher::{TopicHasher, XxTopicHasher};
use crate::node::{Node, NodeId};

/// Default number of virtual positions per node.
pub const DEFAULT_VIRTUAL_NODES: usize = 100;

/// One placement of a node on the ring.
///
/// Positions are totally ordered by `(hash, node)` so that colliding hashes
/// still resolve to a single owner on every node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    /// Point in the hash space.
    pub hash: u64,
    /// Node owning this point.
    pub node: NodeId,
}

/// An immutable-by-convention snapshot of ring placement.
///
/// Mutation goes through [`Ring::insert`] and [`Ring::remove`] on a private
/// copy; readers share snapshots.
#[derive(Clone, Debug)]
pub struct Ring {
    hasher: Arc<dyn TopicHasher>,
    virtual_nodes: usize,
    nodes: BTreeMap<NodeId, Node>,
    positions: Vec<Position>,
}

impl Ring {
    /// Create an empty ring.
    ///
    /// `virtual_nodes` is clamped to at least one.
    #[must_use]
    pub fn new(hasher: Arc<dyn TopicHasher>, virtual_nodes: usize) -> Self {
        Self {
            hasher,
            virtual_nodes: virtual_nodes.max(1),
            nodes: BTreeMap::new(),
            positions: Vec::new(),
        }
    }

    /// Create a ring containing `nodes`.
    #[must_use]
    pub fn with_nodes(
        hasher: Arc<dyn TopicHasher>,
        virtual_nodes: usize,
        nodes: impl IntoIterator<Item = Node>,
    ) -> Self {
        let mut ring = Self::new(hasher, virtual_nodes);
        for node in nodes {
            ring.insert(node);
        }
        ring
    }

    /// Hasher used for topics and positions.
    #[must_use]
    pub fn hasher(&self) -> &Arc<dyn TopicHasher> {
        &self.hasher
    }

    /// Virtual positions per node.
    #[must_use]
    pub const fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Place a node, replacing any previous entry with the same id.
    pub fn insert(&mut self, node: Node) {
        let id = node.id().clone();
        if self.nodes.insert(id.clone(), node).is_some() {
            return;
        }

        for i in 0..self.virtual_nodes {
            let key = format!("{id}#{i}");
            self.positions.push(Position {
                hash: self.hasher.hash(key.as_bytes()),
                node: id.clone(),
            });
        }
        self.positions.sort_unstable();
    }

    /// Remove a node and all its positions.
    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        self.positions.retain(|p| &p.node != id);
        Some(node)
    }

    /// Whether the node is placed on the ring.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes on the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the ring has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes on the ring, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All positions in ring order.
    #[must_use]
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Hash a topic into the ring's hash space.
    #[must_use]
    pub fn hash_topic(&self, topic: &str) -> u64 {
        self.hasher.hash(topic.as_bytes())
    }

    /// Owner of a point: the first position clockwise at or after it, wrapping.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Empty`] if the ring has no positions.
    pub fn owner_of_point(&self, point: u64) -> RingResult<&Node> {
        if self.positions.is_empty() {
            return Err(RingError::Empty);
        }

        let idx = self.positions.partition_point(|p| p.hash < point);
        let position = &self.positions[idx % self.positions.len()];

        self.nodes.get(&position.node).ok_or(RingError::Empty)
    }

    /// Owner of a topic.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::EmptyTopic`] for an empty topic and
    /// [`RingError::Empty`] if the ring has no positions.
    pub fn owner(&self, topic: &str) -> RingResult<&Node> {
        if topic.is_empty() {
            return Err(RingError::EmptyTopic);
        }
        self.owner_of_point(self.hash_topic(topic))
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new(Arc::new(XxTopicHasher::default()), DEFAULT_VIRTUAL_NODES)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;
    use crate::node::NodeStatus;

    /// Hasher with a fixed table, falling back to zero.
    #[derive(Debug, Default)]
    struct TableHasher(HashMap<Vec<u8>, u64>);

    impl TableHasher {
        fn with(mut self, key: &str, value: u64) -> Self {
            self.0.insert(key.as_bytes().to_vec(), value);
            self
        }
    }

    impl TopicHasher for TableHasher {
        fn hash(&self, key: &[u8]) -> u64 {
            self.0.get(key).copied().unwrap_or(0)
        }
    }

    fn node(id: &str) -> Node {
        Node::new(NodeId::new(id), "127.0.0.1", 1).with_status(NodeStatus::Active)
    }

    #[test]
    fn test_empty_ring() {
        let ring = Ring::default();
        assert_matches!(ring.owner("topic"), Err(RingError::Empty));
    }

    #[test]
    fn test_empty_topic() {
        let ring = Ring::with_nodes(Arc::new(XxTopicHasher::default()), 4, [node("a")]);
        assert_matches!(ring.owner(""), Err(RingError::EmptyTopic));
    }

    #[test]
    fn test_next_position_clockwise_with_wrap() {
        let hasher = TableHasher::default()
            .with("a#0", 100)
            .with("b#0", 200)
            .with("t-low", 50)
            .with("t-mid", 150)
            .with("t-exact", 200)
            .with("t-high", 250);
        let ring = Ring::with_nodes(Arc::new(hasher), 1, [node("a"), node("b")]);

        assert_eq!(ring.owner("t-low").unwrap().id().as_str(), "a");
        assert_eq!(ring.owner("t-mid").unwrap().id().as_str(), "b");
        assert_eq!(ring.owner("t-exact").unwrap().id().as_str(), "b");
        assert_eq!(ring.owner("t-high").unwrap().id().as_str(), "a");
    }

    #[test]
    fn test_collision_breaks_tie_by_node_id() {
        let hasher = TableHasher::default()
            .with("a#0", 100)
            .with("b#0", 100)
            .with("t", 100);
        let ring = Ring::with_nodes(Arc::new(hasher), 1, [node("b"), node("a")]);

        assert_eq!(ring.owner("t").unwrap().id().as_str(), "a");
    }

    #[test]
    fn test_same_view_same_owner_regardless_of_insert_order() {
        let hasher: Arc<dyn TopicHasher> = Arc::new(XxTopicHasher::default());
        let one = Ring::with_nodes(hasher.clone(), 16, [node("a"), node("b"), node("c")]);
        let two = Ring::with_nodes(hasher, 16, [node("c"), node("a"), node("b")]);

        for i in 0..500 {
            let topic = format!("topic-{i}");
            assert_eq!(one.owner(&topic).unwrap().id(), two.owner(&topic).unwrap().id());
            assert_eq!(one.owner(&topic).unwrap().id(), one.owner(&topic).unwrap().id());
        }
    }

    #[test]
    fn test_virtual_nodes_spread_ownership() {
        let ring = Ring::with_nodes(
            Arc::new(XxTopicHasher::default()),
            DEFAULT_VIRTUAL_NODES,
            [node("a"), node("b"), node("c")],
        );
        assert_eq!(ring.positions().len(), 3 * DEFAULT_VIRTUAL_NODES);

        let mut counts: HashMap<NodeId, usize> = HashMap::new();
        for i in 0..3000 {
            let owner = ring.owner(&format!("topic-{i}")).unwrap();
            *counts.entry(owner.id().clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count > 500, "unbalanced ring: {counts:?}");
        }
    }

    #[test]
    fn test_remove_only_moves_removed_nodes_topics() {
        let hasher: Arc<dyn TopicHasher> = Arc::new(XxTopicHasher::default());
        let full = Ring::with_nodes(hasher.clone(), 32, [node("a"), node("b"), node("c")]);
        let mut reduced = full.clone();
        reduced.remove(&NodeId::new("c"));

        assert!(!reduced.contains(&NodeId::new("c")));
        assert_eq!(reduced.positions().len(), 64);

        for i in 0..500 {
            let topic = format!("topic-{i}");
            let before = full.owner(&topic).unwrap().id().as_str();
            let after = reduced.owner(&topic).unwrap().id().as_str();
            if before != "c" {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_insert_same_node_twice_keeps_positions() {
        let mut ring = Ring::new(Arc::new(XxTopicHasher::default()), 8);
        ring.insert(node("a"));
        ring.insert(node("a"));

        assert_eq!(ring.len(), 1);
        assert_eq!(ring.positions().len(), 8);
    }
}
