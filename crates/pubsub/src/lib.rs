//! In-process publish/subscribe for a single ringmq node.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod handler;
mod interest;
mod local;
mod message;
mod topic;

pub use error::{HandlerError, PubSubError, PubSubResult};
pub use handler::{FnHandler, SubscriptionHandler, handler_fn};
pub use interest::InterestTracker;
pub use local::{LocalPubSub, SubscriptionHandle, SubscriptionId};
pub use message::Message;
pub use topic::{topic_matches, validate_pattern};
