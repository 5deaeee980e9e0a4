use async_trait::async_trait;
use bytes::Bytes;
use ringmq_protocol::{CallResult, Frame};

/// Outbound channel used to reach other members by ring address.
#[async_trait]
pub trait MembershipTransport: Send + Sync + 'static {
    /// Send a request to the member listening on `address` and await its ack.
    async fn call(&self, address: &str, frame: Frame) -> CallResult<Bytes>;
}
