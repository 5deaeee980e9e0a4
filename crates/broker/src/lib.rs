//! A ringmq broker node.
//!
//! Nodes share the topic namespace through a consistent-hash ring. Clients
//! connect to any node; a publish is routed to the topic's owner, which
//! delivers it to its own subscribers and to every node that registered
//! interest in the topic.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod broker;
mod config;
mod context;
mod error;
mod interest;
mod pool;
mod publisher;
mod session;

pub use broker::{Broker, BrokerEvent, BrokerState};
pub use config::{BrokerConfig, InterfaceConfig, ProtocolConfig};
pub use error::{BrokerError, BrokerResult};
pub use interest::InterestPropagation;
pub use pool::{Dialed, PeerPool, PoolEvent};
pub use publisher::ClusterPublisher;
