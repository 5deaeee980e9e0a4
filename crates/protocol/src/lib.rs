//! Length-framed, multiplexed request/acknowledgement protocol.
//!
//! Every connection carries any number of concurrent calls. Each request frame
//! is tagged with a correlation id that the peer echoes in exactly one `Ack`
//! frame, so acknowledgements may arrive in any order.
//!
//! Both roles run over the same [`Connection`]: outbound calls are issued with
//! [`Connection::call`], and inbound requests surface on the [`Incoming`]
//! receiver returned alongside it, each carrying a [`Responder`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod connection;
mod error;
mod frame;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use connection::{Connection, ConnectionConfig, InboundCall, Incoming, Responder};
pub use error::{CallError, CallResult, ProtocolError, ProtocolResult};
pub use frame::{Frame, FrameKind};
