//! Registers this node's interest in remotely owned topics.
//!
//! Interest is aggregated per topic: however many local subscribers a topic
//! has, the owner holds a single record for this node. The record follows
//! ownership as the ring changes.
//!
//! Work on one topic is serialized, so a subscriber is only counted once the
//! registration it depends on has been acknowledged.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use ringmq_membership::RingMembership;
use ringmq_protocol::{Frame, FrameKind};
use ringmq_ring::{Node, NodeId};
use tracing::{debug, info, warn};

use crate::error::BrokerResult;
use crate::pool::PeerPool;

/// Where the interest in a topic is registered.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Home {
    /// This node owns the topic.
    Local,
    /// Registered with a remote owner.
    Remote { id: NodeId, address: String },
    /// Not registered anywhere yet.
    Unregistered,
}

#[derive(Debug)]
struct TopicInterest {
    subscribers: usize,
    home: Home,
}

/// Tracks local subscriber counts and keeps owners informed.
#[derive(Clone, Debug)]
pub struct InterestPropagation {
    membership: RingMembership,
    pool: PeerPool,
    topics: Arc<Mutex<HashMap<String, TopicInterest>>>,
    /// One registration change at a time per topic.
    locks: Arc<DashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InterestPropagation {
    /// Create a propagator for the local node.
    #[must_use]
    pub fn new(membership: RingMembership, pool: PeerPool) -> Self {
        Self {
            membership,
            pool,
            topics: Arc::new(Mutex::new(HashMap::new())),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Count a new local subscriber of `topic`.
    ///
    /// The first subscriber registers interest with the topic's owner. Later
    /// ones wait for that registration; if it failed they try again.
    ///
    /// # Errors
    ///
    /// Fails if the owner cannot be reached or rejects the registration; the
    /// subscriber is not counted in that case.
    pub async fn acquire(&self, topic: &str) -> BrokerResult<()> {
        self.serialized(topic, self.count_subscriber(topic)).await
    }

    /// Count a local subscriber of `topic` as gone.
    ///
    /// The last one withdraws the registration at the owner.
    pub async fn release(&self, topic: &str) {
        self.serialized(topic, self.forget_subscriber(topic)).await;
    }

    /// Owner the interest in `topic` is registered with; `None` when this
    /// node owns it or nobody subscribes locally.
    #[must_use]
    pub fn homed_at(&self, topic: &str) -> Option<NodeId> {
        match self.topics.lock().get(topic).map(|interest| &interest.home) {
            Some(Home::Remote { id, .. }) => Some(id.clone()),
            _ => None,
        }
    }

    /// Number of local subscribers counted for `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |interest| interest.subscribers)
    }

    /// Re-register every topic whose owner changed.
    pub async fn rebalance(&self) {
        let topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        for topic in topics {
            self.serialized(&topic, self.rehome(&topic)).await;
        }
    }

    /// Forget registrations that went over a lost connection and register
    /// them again with the current owners.
    pub async fn on_peer_disconnected(&self, address: &str) {
        // Topics still registering may be about to land on the lost peer.
        let mut candidates: Vec<String> = self.topics.lock().keys().cloned().collect();
        candidates.extend(self.locks.iter().map(|entry| entry.key().clone()));
        candidates.sort_unstable();
        candidates.dedup();

        let mut lost = 0;
        for topic in candidates {
            if self.serialized(&topic, async { self.unhome(&topic, address) }).await {
                lost += 1;
            }
        }
        if lost > 0 {
            debug!("{} interest registrations lost with {}", lost, address);
            self.rebalance().await;
        }
    }

    /// Run `work` while holding the lock of `topic`.
    async fn serialized<T>(&self, topic: &str, work: impl Future<Output = T>) -> T {
        let lock = Arc::clone(self.locks.entry(topic.to_string()).or_default().value());
        let output = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        self.locks
            .remove_if(topic, |_, lock| Arc::strong_count(lock) == 1);
        output
    }

    async fn count_subscriber(&self, topic: &str) -> BrokerResult<()> {
        {
            let mut topics = self.topics.lock();
            if let Some(interest) = topics
                .get_mut(topic)
                .filter(|interest| interest.home != Home::Unregistered)
            {
                interest.subscribers += 1;
                return Ok(());
            }
        }

        let home = self.register(topic).await?;
        let mut topics = self.topics.lock();
        let interest = topics.entry(topic.to_string()).or_insert(TopicInterest {
            subscribers: 0,
            home: Home::Unregistered,
        });
        interest.subscribers += 1;
        interest.home = home;
        Ok(())
    }

    async fn forget_subscriber(&self, topic: &str) {
        let withdrawn = {
            let mut topics = self.topics.lock();
            match topics.get_mut(topic) {
                Some(interest) if interest.subscribers > 1 => {
                    interest.subscribers -= 1;
                    None
                }
                Some(_) => topics.remove(topic).map(|interest| interest.home),
                None => None,
            }
        };

        if let Some(Home::Remote { id, address }) = withdrawn {
            self.unregister(topic, &id, &address).await;
        }
    }

    async fn rehome(&self, topic: &str) {
        let Some(current) = self.topics.lock().get(topic).map(|interest| interest.home.clone())
        else {
            return;
        };
        let Ok(owner) = self.membership.owner_of(topic) else {
            return;
        };
        let desired = self.home_for(&owner);
        let moved = match (&current, &desired) {
            (Home::Remote { id, .. }, Home::Remote { id: new, .. }) => id != new,
            (Home::Unregistered, _) => true,
            (a, b) => a != b,
        };
        if !moved {
            return;
        }

        info!("Re-homing interest in '{}' to {}", topic, owner);
        let home = match &desired {
            Home::Remote { address, .. } => match self.send_registration(topic, address).await {
                Ok(()) => desired,
                Err(e) => {
                    warn!("Could not register '{}' with {}: {}", topic, owner, e);
                    Home::Unregistered
                }
            },
            _ => desired,
        };
        if let Some(interest) = self.topics.lock().get_mut(topic) {
            interest.home = home;
        }

        if let Home::Remote { id, address } = &current {
            self.unregister(topic, id, address).await;
        }
    }

    /// Mark `topic` unregistered if its record lived at `address`.
    fn unhome(&self, topic: &str, address: &str) -> bool {
        match self.topics.lock().get_mut(topic) {
            Some(interest)
                if matches!(&interest.home, Home::Remote { address: a, .. } if a == address) =>
            {
                interest.home = Home::Unregistered;
                true
            }
            _ => false,
        }
    }

    fn home_for(&self, owner: &Node) -> Home {
        if owner.id() == self.membership.node_id() {
            Home::Local
        } else {
            Home::Remote {
                id: owner.id().clone(),
                address: owner.address(),
            }
        }
    }

    async fn register(&self, topic: &str) -> BrokerResult<Home> {
        let owner = self.membership.owner_of(topic)?;
        let home = self.home_for(&owner);
        if let Home::Remote { address, .. } = &home {
            self.send_registration(topic, address).await?;
            info!("Registered interest in '{}' with {}", topic, owner);
        }
        Ok(home)
    }

    async fn send_registration(&self, topic: &str, address: &str) -> BrokerResult<()> {
        let frame = Frame::request(FrameKind::Subscribe, topic, Bytes::new())
            .with_origin(self.membership.node_id().as_str());
        self.pool.get(address).await?.call(frame).await?;
        Ok(())
    }

    async fn unregister(&self, topic: &str, id: &NodeId, address: &str) {
        let frame = Frame::request(FrameKind::Unsubscribe, topic, Bytes::new())
            .with_origin(self.membership.node_id().as_str());
        let result = match self.pool.get(address).await {
            Ok(connection) => connection.call(frame).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(_) => info!("Released interest in '{}' at {}", topic, id),
            Err(e) => debug!("Releasing interest in '{}' at {} failed: {}", topic, id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use ringmq_membership::RingConfig;
    use ringmq_protocol::{Connection, ConnectionConfig};
    use ringmq_ring::XxTopicHasher;
    use tokio::net::TcpListener;

    use super::*;
    use crate::error::BrokerError;
    use crate::pool::Dialed;

    /// A remote owner that acknowledges interest frames after `delay`,
    /// rejecting the first `rejections` subscribes.
    async fn owner(delay: Duration, rejections: usize) -> (String, Arc<Mutex<Vec<FrameKind>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscribes = Arc::new(AtomicUsize::new(0));

        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let (connection, incoming) =
                    Connection::new(stream, peer.to_string(), &ConnectionConfig::default());
                let recorded = Arc::clone(&recorded);
                let subscribes = Arc::clone(&subscribes);
                tokio::spawn(async move {
                    while let Some(call) = incoming.recv().await {
                        let kind = call.frame.kind;
                        recorded.lock().push(kind);
                        let rejected = kind == FrameKind::Subscribe
                            && subscribes.fetch_add(1, Ordering::SeqCst) < rejections;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let result = if rejected {
                                Err("not ready".to_string())
                            } else {
                                Ok(Bytes::new())
                            };
                            call.responder.ack(result).await;
                        });
                    }
                    drop(connection);
                });
            }
        });
        (address, seen)
    }

    /// Propagation of a node whose ring also holds the owner at `address`.
    fn propagation(address: &str) -> (InterestPropagation, NodeId, flume::Receiver<Dialed>) {
        let (pool, dialed) = PeerPool::new(ConnectionConfig::default(), Duration::from_millis(500));
        let membership = RingMembership::new(
            RingConfig::default(),
            "127.0.0.1:1",
            Arc::new(XxTopicHasher::default()),
            Arc::new(pool.clone()),
        )
        .unwrap();

        let remote = Node::from_address(NodeId::new("owner"), address).unwrap();
        let mut record = Vec::new();
        ciborium::ser::into_writer(&remote, &mut record).unwrap();
        membership.handle_join(&record).unwrap();

        (
            InterestPropagation::new(membership, pool),
            remote.id().clone(),
            dialed,
        )
    }

    fn remote_topic(propagation: &InterestPropagation) -> String {
        (0..)
            .map(|i| format!("topic-{i}"))
            .find(|topic| !propagation.membership.allocated_to_me(topic))
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_subscriber_registers_once() {
        let (address, seen) = owner(Duration::ZERO, 0).await;
        let (propagation, owner_id, _dialed) = propagation(&address);
        let topic = remote_topic(&propagation);

        propagation.acquire(&topic).await.unwrap();
        propagation.acquire(&topic).await.unwrap();
        assert_eq!(propagation.subscribers(&topic), 2);
        assert_eq!(propagation.homed_at(&topic), Some(owner_id));

        propagation.release(&topic).await;
        assert_eq!(propagation.subscribers(&topic), 1);
        propagation.release(&topic).await;
        assert_eq!(propagation.subscribers(&topic), 0);
        assert_eq!(propagation.homed_at(&topic), None);

        assert_eq!(
            *seen.lock(),
            vec![FrameKind::Subscribe, FrameKind::Unsubscribe]
        );
    }

    #[tokio::test]
    async fn test_waiting_subscriber_retries_failed_registration() {
        let (address, seen) = owner(Duration::from_millis(200), 1).await;
        let (propagation, owner_id, _dialed) = propagation(&address);
        let topic = remote_topic(&propagation);

        let first = {
            let propagation = propagation.clone();
            let topic = topic.clone();
            tokio::spawn(async move { propagation.acquire(&topic).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Not confirmed while the first registration is still in flight.
        let second = propagation.acquire(&topic).await;
        assert!(first.is_finished());
        assert_matches!(
            first.await.unwrap(),
            Err(BrokerError::Delivery(reason)) if reason == "not ready"
        );
        assert!(second.is_ok());

        assert_eq!(propagation.subscribers(&topic), 1);
        assert_eq!(propagation.homed_at(&topic), Some(owner_id));
        assert_eq!(
            *seen.lock(),
            vec![FrameKind::Subscribe, FrameKind::Subscribe]
        );
    }

    #[tokio::test]
    async fn test_release_during_registration_withdraws_it() {
        let (address, seen) = owner(Duration::from_millis(200), 0).await;
        let (propagation, _owner_id, _dialed) = propagation(&address);
        let topic = remote_topic(&propagation);

        let acquire = {
            let propagation = propagation.clone();
            let topic = topic.clone();
            tokio::spawn(async move { propagation.acquire(&topic).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        propagation.release(&topic).await;
        acquire.await.unwrap().unwrap();

        assert_eq!(propagation.subscribers(&topic), 0);
        assert_eq!(propagation.homed_at(&topic), None);
        assert_eq!(
            *seen.lock(),
            vec![FrameKind::Subscribe, FrameKind::Unsubscribe]
        );
    }

    #[tokio::test]
    async fn test_local_topic_needs_no_registration() {
        let (address, seen) = owner(Duration::ZERO, 0).await;
        let (propagation, _owner_id, _dialed) = propagation(&address);
        let topic = (0..)
            .map(|i| format!("topic-{i}"))
            .find(|topic| propagation.membership.allocated_to_me(topic))
            .unwrap();

        propagation.acquire(&topic).await.unwrap();
        assert_eq!(propagation.subscribers(&topic), 1);
        assert_eq!(propagation.homed_at(&topic), None);
        propagation.release(&topic).await;

        assert!(seen.lock().is_empty());
    }
}
