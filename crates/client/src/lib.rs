//! Client library for ringmq brokers.
//!
//! ```no_run
//! # async fn example() -> ringmq_client::ClientResult<()> {
//! use ringmq_client::{Client, Message, handler_fn};
//!
//! let client = Client::connect("127.0.0.1:4000").await?;
//! client
//!     .on("orders", handler_fn(|message: Message| async move {
//!         println!("{:?}", message.payload);
//!         Ok(())
//!     }))
//!     .await?;
//! client.emit("orders", "hello").await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, ClientResult};
pub use ringmq_pubsub::{HandlerError, Message, SubscriptionHandler, handler_fn};
