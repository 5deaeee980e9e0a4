//! Interest tracking for topic owners
//!
//! Records which remote nodes want deliveries for which topics. Each record
//! carries a sink `S` (for the broker, the connection the interest arrived on)
//! so the owner can fan a message out to every interested node exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use ringmq_ring::NodeId;
use tracing::debug;

type TopicInterests<S> = HashMap<String, HashMap<NodeId, S>>;

/// Tracks remote interest per (node, topic) pair.
#[derive(Debug)]
pub struct InterestTracker<S> {
    /// Topic -> interested nodes and their sinks
    topic_interests: Arc<RwLock<TopicInterests<S>>>,

    /// Reverse index: node -> topics
    node_topics: Arc<RwLock<HashMap<NodeId, HashSet<String>>>>,
}

impl<S> Clone for InterestTracker<S> {
    fn clone(&self) -> Self {
        Self {
            topic_interests: Arc::clone(&self.topic_interests),
            node_topics: Arc::clone(&self.node_topics),
        }
    }
}

impl<S> Default for InterestTracker<S> {
    fn default() -> Self {
        Self {
            topic_interests: Arc::new(RwLock::new(HashMap::new())),
            node_topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<S: Clone> InterestTracker<S> {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's interest in a topic, replacing the sink of an existing
    /// record. Returns `true` if the pair was not recorded before.
    pub fn add(&self, node: NodeId, topic: &str, sink: S) -> bool {
        let mut topic_interests = self.topic_interests.write();
        let mut node_topics = self.node_topics.write();

        let added = topic_interests
            .entry(topic.to_string())
            .or_default()
            .insert(node.clone(), sink)
            .is_none();
        node_topics
            .entry(node.clone())
            .or_default()
            .insert(topic.to_string());

        if added {
            debug!("Added remote interest: {} -> {}", node, topic);
        }
        added
    }

    /// Remove a node's interest in a topic, returning its sink.
    pub fn remove(&self, node: &NodeId, topic: &str) -> Option<S> {
        let mut topic_interests = self.topic_interests.write();
        let mut node_topics = self.node_topics.write();

        let sink = match topic_interests.get_mut(topic) {
            Some(nodes) => {
                let sink = nodes.remove(node);
                if nodes.is_empty() {
                    topic_interests.remove(topic);
                }
                sink
            }
            None => None,
        };

        if let Some(topics) = node_topics.get_mut(node) {
            topics.remove(topic);
            if topics.is_empty() {
                node_topics.remove(node);
            }
        }

        if sink.is_some() {
            debug!("Removed remote interest: {} -> {}", node, topic);
        }
        sink
    }

    /// Remove every interest of a node. Returns the topics it was interested in.
    pub fn remove_node(&self, node: &NodeId) -> Vec<String> {
        let mut topic_interests = self.topic_interests.write();
        let mut node_topics = self.node_topics.write();

        let topics: Vec<String> = node_topics
            .remove(node)
            .map(|topics| topics.into_iter().collect())
            .unwrap_or_default();

        for topic in &topics {
            if let Some(nodes) = topic_interests.get_mut(topic) {
                nodes.remove(node);
                if nodes.is_empty() {
                    topic_interests.remove(topic);
                }
            }
        }

        if !topics.is_empty() {
            debug!("Removed all interests for node {}", node);
        }
        topics
    }

    /// Remove every record whose sink matches `predicate`.
    pub fn remove_where(&self, predicate: impl Fn(&S) -> bool) -> Vec<(NodeId, String)> {
        let mut topic_interests = self.topic_interests.write();
        let mut node_topics = self.node_topics.write();
        let mut removed = Vec::new();

        topic_interests.retain(|topic, nodes| {
            nodes.retain(|node, sink| {
                if predicate(sink) {
                    removed.push((node.clone(), topic.clone()));
                    false
                } else {
                    true
                }
            });
            !nodes.is_empty()
        });

        for (node, topic) in &removed {
            if let Some(topics) = node_topics.get_mut(node) {
                topics.remove(topic);
                if topics.is_empty() {
                    node_topics.remove(node);
                }
            }
        }

        removed
    }

    /// Nodes interested in `topic`, with their sinks.
    #[must_use]
    pub fn interested(&self, topic: &str) -> Vec<(NodeId, S)> {
        self.topic_interests
            .read()
            .get(topic)
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|(node, sink)| (node.clone(), sink.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Topics a node is interested in.
    #[must_use]
    pub fn topics_of(&self, node: &NodeId) -> HashSet<String> {
        self.node_topics
            .read()
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of (node, topic) records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topic_interests.read().values().map(HashMap::len).sum()
    }

    /// Whether no interest is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topic_interests.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_interest_is_per_node_and_topic() {
        let tracker = InterestTracker::new();

        assert!(tracker.add(node("a"), "orders", 1));
        assert!(!tracker.add(node("a"), "orders", 2));
        assert!(tracker.add(node("b"), "orders", 3));

        let mut interested = tracker.interested("orders");
        interested.sort();
        assert_eq!(interested, vec![(node("a"), 2), (node("b"), 3)]);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_remove() {
        let tracker = InterestTracker::new();
        tracker.add(node("a"), "orders", ());

        assert_eq!(tracker.remove(&node("a"), "orders"), Some(()));
        assert_eq!(tracker.remove(&node("a"), "orders"), None);
        assert!(tracker.is_empty());
        assert!(tracker.topics_of(&node("a")).is_empty());
    }

    #[test]
    fn test_remove_node() {
        let tracker = InterestTracker::new();
        tracker.add(node("a"), "orders", ());
        tracker.add(node("a"), "invoices", ());
        tracker.add(node("b"), "orders", ());

        let mut topics = tracker.remove_node(&node("a"));
        topics.sort();
        assert_eq!(topics, vec!["invoices", "orders"]);
        assert_eq!(tracker.interested("orders"), vec![(node("b"), ())]);
        assert!(tracker.interested("invoices").is_empty());
    }

    #[test]
    fn test_remove_where_sink_matches() {
        let tracker = InterestTracker::new();
        tracker.add(node("a"), "orders", 7_u64);
        tracker.add(node("a"), "invoices", 8_u64);
        tracker.add(node("b"), "orders", 7_u64);

        let mut removed = tracker.remove_where(|conn| *conn == 7);
        removed.sort();
        assert_eq!(
            removed,
            vec![(node("a"), "orders".to_string()), (node("b"), "orders".to_string())]
        );
        assert_eq!(tracker.topics_of(&node("a")).len(), 1);
        assert!(tracker.topics_of(&node("b")).is_empty());
    }
}
