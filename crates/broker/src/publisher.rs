//! Routes publishes to the owner of their topic.

use futures::future::join_all;
use ringmq_membership::RingMembership;
use ringmq_protocol::{Connection, Frame, FrameKind};
use ringmq_pubsub::{InterestTracker, LocalPubSub, Message};
use ringmq_ring::NodeId;
use tracing::{debug, trace, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::pool::PeerPool;

/// Publishes locally when this node owns the topic and forwards otherwise.
///
/// The owner fans a message out to its own subscribers and to every node that
/// registered interest in the topic, once each.
#[derive(Clone, Debug)]
pub struct ClusterPublisher {
    membership: RingMembership,
    local: LocalPubSub,
    interests: InterestTracker<Connection>,
    pool: PeerPool,
}

impl ClusterPublisher {
    /// Create a publisher over the node's components.
    #[must_use]
    pub const fn new(
        membership: RingMembership,
        local: LocalPubSub,
        interests: InterestTracker<Connection>,
        pool: PeerPool,
    ) -> Self {
        Self {
            membership,
            local,
            interests,
            pool,
        }
    }

    /// Publish `message` and wait until every subscriber acknowledged.
    ///
    /// `origin` is set when another node forwarded the publish; such a
    /// publish is always handled as owner so it is never forwarded twice.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Delivery`] if any subscriber failed or the owner
    /// could not be reached.
    pub async fn publish(&self, message: Message, origin: Option<&str>) -> BrokerResult<()> {
        if origin.is_some() || self.membership.allocated_to_me(&message.topic) {
            return self.deliver_as_owner(message).await;
        }

        let owner = self.membership.owner_of(&message.topic)?;
        trace!("Forwarding '{}' to owner {}", message.topic, owner);

        let connection = self.pool.get(&owner.address()).await.map_err(|e| {
            BrokerError::Delivery(format!("owner {} of '{}' unreachable: {e}", owner, message.topic))
        })?;

        let frame = Frame::request(FrameKind::Publish, message.topic, message.payload)
            .with_origin(self.membership.node_id().as_str());
        connection.call(frame).await?;
        Ok(())
    }

    async fn deliver_as_owner(&self, message: Message) -> BrokerResult<()> {
        let remotes = self.interests.interested(&message.topic);
        trace!(
            "Delivering '{}' to local subscribers and {} interested nodes",
            message.topic,
            remotes.len()
        );

        let remote_deliveries = remotes
            .into_iter()
            .map(|(node, connection)| self.deliver_to(node, connection, message.clone()));

        let (local, remote) = tokio::join!(
            self.local.publish_local(message.clone()),
            join_all(remote_deliveries)
        );

        local?;
        remote.into_iter().collect()
    }

    async fn deliver_to(
        &self,
        node: NodeId,
        connection: Connection,
        message: Message,
    ) -> BrokerResult<()> {
        let topic = message.topic.clone();
        let frame = Frame::request(FrameKind::Deliver, message.topic, message.payload);

        match connection.call(frame).await {
            Ok(_) => {
                debug!("Delivered '{}' to {}", topic, node);
                Ok(())
            }
            Err(e) => {
                warn!("Delivering '{}' to {} failed: {}", topic, node, e);
                Err(e.into())
            }
        }
    }
}
