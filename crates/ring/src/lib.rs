//! Consistent-hash ring for ringmq.
//!
//! This crate provides:
//! - Node identity types (`NodeId`, `Node`, `NodeStatus`)
//! - The `Ring` of virtual positions and its owner lookup
//! - The injectable `TopicHasher` used to place topics and positions
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
pub mod hasher;
pub mod node;
pub mod ring;
pub mod router;

pub use error::{RingError, RingResult};
pub use hasher::{TopicHasher, XxTopicHasher};
pub use node::{Node, NodeId, NodeStatus};
pub use ring::{DEFAULT_VIRTUAL_NODES, Position, Ring};
pub use router::owner;
