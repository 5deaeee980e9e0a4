//! Ring membership for ringmq.
//!
//! Maintains the set of known nodes, places the active ones on a consistent
//! hash ring and converges that view across the cluster:
//! - `join` contacts seeds until one admits this node and returns its view
//! - a periodic anti-entropy round syncs full views with one random peer
//! - failed rounds mark a peer suspected, then departed
//! - `leave` announces departure to every active peer
//!
//! Owner lookups read a lock-free ring snapshot.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod event;
mod membership;
mod table;
mod transport;

pub use config::RingConfig;
pub use error::{MembershipError, MembershipResult};
pub use event::MembershipEvent;
pub use membership::RingMembership;
pub use table::MemberTable;
pub use transport::MembershipTransport;
