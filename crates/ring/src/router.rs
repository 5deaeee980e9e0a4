//! Topic routing over a ring snapshot.

use crate::error::RingResult;
use crate::node::Node;
use crate::ring::Ring;

/// Resolve the node owning `topic` in the given ring snapshot.
///
/// Pure: the same snapshot and topic always yield the same node.
///
/// # Errors
///
/// Fails for an empty topic or an empty ring.
pub fn owner<'a>(ring: &'a Ring, topic: &str) -> RingResult<&'a Node> {
    ring.owner(topic)
}
