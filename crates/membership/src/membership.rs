use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use ringmq_protocol::{Frame, FrameKind};
use ringmq_ring::{Node, NodeId, NodeStatus, Ring, TopicHasher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::error::{MembershipError, MembershipResult};
use crate::event::MembershipEvent;
use crate::table::MemberTable;
use crate::transport::MembershipTransport;

/// Pause between rounds over the seed list while joining.
const SEED_RETRY_DELAY: Duration = Duration::from_millis(50);

struct Inner {
    config: RingConfig,
    address: String,
    local_id: NodeId,
    hasher: Arc<dyn TopicHasher>,
    transport: Arc<dyn MembershipTransport>,
    table: RwLock<MemberTable>,
    ring: ArcSwap<Ring>,
    events: broadcast::Sender<MembershipEvent>,
    ready: AtomicBool,
    last_change: Mutex<Instant>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Cluster membership and ring ownership for one node.
#[derive(Clone)]
pub struct RingMembership {
    inner: Arc<Inner>,
}

impl RingMembership {
    /// Create the membership of a node whose ring listener is at `address`.
    ///
    /// The node starts active and alone on its ring; call [`Self::join`] to
    /// merge with a cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is not `host:port`.
    pub fn new(
        config: RingConfig,
        address: impl Into<String>,
        hasher: Arc<dyn TopicHasher>,
        transport: Arc<dyn MembershipTransport>,
    ) -> MembershipResult<Self> {
        let address = address.into();
        let local_id = NodeId::generate(&address);
        let local = Node::from_address(local_id.clone(), &address)?.with_status(NodeStatus::Active);

        let ring = Ring::with_nodes(Arc::clone(&hasher), config.virtual_nodes, [local.clone()]);
        let (events, _) = broadcast::channel(256);

        debug!("Created membership for {}", local);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                address,
                local_id,
                hasher,
                transport,
                table: RwLock::new(MemberTable::new(local)),
                ring: ArcSwap::from_pointee(ring),
                events,
                ready: AtomicBool::new(false),
                last_change: Mutex::new(Instant::now()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// Ring address of this node (`host:port`).
    #[must_use]
    pub fn who_am_i(&self) -> &str {
        &self.inner.address
    }

    /// Id of this node.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.inner.local_id
    }

    /// Current record of this node.
    #[must_use]
    pub fn local_node(&self) -> Node {
        self.inner.table.read().local().clone()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &RingConfig {
        &self.inner.config
    }

    /// Whether the join has completed and the node has not left.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Lock-free snapshot of the current ring.
    #[must_use]
    pub fn ring(&self) -> Arc<Ring> {
        self.inner.ring.load_full()
    }

    /// Node owning `topic` in the current ring.
    ///
    /// # Errors
    ///
    /// Fails for an empty topic, or once the node has left and its ring is empty.
    pub fn owner_of(&self, topic: &str) -> MembershipResult<Node> {
        Ok(self.inner.ring.load().owner(topic)?.clone())
    }

    /// Whether this node owns `topic` in the current ring.
    #[must_use]
    pub fn allocated_to_me(&self, topic: &str) -> bool {
        self.inner
            .ring
            .load()
            .owner(topic)
            .is_ok_and(|owner| owner.id() == &self.inner.local_id)
    }

    /// Every known member, departed ones included.
    #[must_use]
    pub fn members(&self) -> Vec<Node> {
        self.inner.table.read().view()
    }

    /// Active members other than this node.
    #[must_use]
    pub fn peers(&self) -> Vec<Node> {
        self.inner.table.read().peers()
    }

    /// Subscribe to membership change notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }

    /// Join the cluster through `seeds`.
    ///
    /// Seeds are tried in order, repeatedly, until one admits this node or
    /// `timeout` elapses. After admission the node waits for its view to stay
    /// unchanged for the settle window, bounded by the same deadline. An empty
    /// seed list (ignoring this node's own address) starts a new ring.
    ///
    /// # Errors
    ///
    /// Returns [`MembershipError::JoinTimeout`] if no seed admits this node in
    /// time.
    pub async fn join(&self, seeds: &[String], timeout: Duration) -> MembershipResult<()> {
        let seeds: Vec<&String> = seeds
            .iter()
            .filter(|seed| seed.as_str() != self.inner.address)
            .collect();

        if seeds.is_empty() {
            info!("No seeds given; {} starts a new ring", self.inner.address);
            self.mark_ready();
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let request = Frame::request(FrameKind::Join, "", encode(&self.local_node())?);

        let mut admitted = false;
        'rounds: while Instant::now() < deadline {
            for seed in &seeds {
                if self.inner.shutdown.is_cancelled() {
                    return Err(MembershipError::ShutDown);
                }

                let attempt = self.inner.transport.call(seed, request.clone());
                match timeout_at(deadline, attempt).await {
                    Ok(Ok(payload)) => match decode::<Vec<Node>>(&payload) {
                        Ok(view) => {
                            self.update(|table| table.merge(view));
                            info!("Joined ring through seed {}", seed);
                            admitted = true;
                            break 'rounds;
                        }
                        Err(e) => warn!("Seed {} sent an unreadable view: {}", seed, e),
                    },
                    Ok(Err(e)) => debug!("Seed {} did not admit us: {}", seed, e),
                    Err(_) => break 'rounds,
                }
            }
            sleep_until((Instant::now() + SEED_RETRY_DELAY).min(deadline)).await;
        }

        if !admitted {
            warn!("No seed admitted {} within {:?}", self.inner.address, timeout);
            return Err(MembershipError::JoinTimeout(timeout));
        }

        let settle = self.inner.config.settle();
        loop {
            let quiet_for = self.inner.last_change.lock().elapsed();
            let now = Instant::now();
            if quiet_for >= settle || now >= deadline {
                break;
            }
            sleep_until((now + (settle - quiet_for)).min(deadline)).await;
        }

        self.mark_ready();
        Ok(())
    }

    /// Announce departure to every active peer and stop background work.
    ///
    /// Announcements are bounded by the join timeout; unreachable peers will
    /// detect the departure through failed sync rounds instead. Calling it
    /// again is a no-op.
    pub async fn leave(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let peers = self.peers();
        let record = {
            let mut departed = None;
            self.update(|table| {
                departed = Some(table.depart_local());
                Vec::new()
            });
            departed.unwrap_or_else(|| self.local_node())
        };
        self.inner.ready.store(false, Ordering::Release);
        self.inner.shutdown.cancel();

        match encode(&record) {
            Ok(payload) => {
                let request = Frame::request(FrameKind::Leave, "", payload);
                let limit = self.inner.config.join_timeout();
                let announcements = peers.iter().map(|peer| {
                    let address = peer.address();
                    let request = request.clone();
                    async move {
                        let result = timeout(limit, self.inner.transport.call(&address, request)).await;
                        (address, result)
                    }
                });

                for (address, result) in futures::future::join_all(announcements).await {
                    match result {
                        Ok(Ok(_)) => debug!("Announced departure to {}", address),
                        Ok(Err(e)) => debug!("Departure announcement to {} failed: {}", address, e),
                        Err(_) => debug!("Departure announcement to {} timed out", address),
                    }
                }
            }
            Err(e) => warn!("Could not encode departure record: {}", e),
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("{} left the ring", self.inner.address);
    }

    /// Handle a `Join` request: admit the sender and return the full view.
    ///
    /// The updated view is pushed to every other active member.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not a node record or this node has left.
    pub fn handle_join(&self, payload: &[u8]) -> MembershipResult<Bytes> {
        self.ensure_running()?;

        let joiner: Node = decode(payload)?;
        let joiner_id = joiner.id().clone();
        info!("Admitting {} to the ring", joiner);
        self.update(|table| table.admit(joiner));

        let view = self.encoded_view()?;
        for peer in self.peers() {
            if peer.id() == &joiner_id {
                continue;
            }
            let this = self.clone();
            let view = view.clone();
            self.inner.tracker.spawn(async move { this.push_view(peer, view).await });
        }

        Ok(view)
    }

    /// Handle a `Sync` request: merge the sender's view and return ours.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not a view or this node has left.
    pub fn handle_sync(&self, payload: &[u8]) -> MembershipResult<Bytes> {
        self.ensure_running()?;

        let view: Vec<Node> = decode(payload)?;
        self.update(|table| table.merge(view));
        self.encoded_view()
    }

    /// Handle a `Leave` announcement.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not a node record.
    pub fn handle_leave(&self, payload: &[u8]) -> MembershipResult<Bytes> {
        let record: Node = decode(payload)?;
        info!("{} announced departure", record);
        self.update(|table| table.merge(vec![record]));
        Ok(Bytes::new())
    }

    fn ensure_running(&self) -> MembershipResult<()> {
        if self.inner.shutdown.is_cancelled() {
            Err(MembershipError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn encoded_view(&self) -> MembershipResult<Bytes> {
        let view = self.inner.table.read().view();
        encode(&view)
    }

    fn mark_ready(&self) {
        if self.inner.ready.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "{} ready with {} ring members",
            self.inner.address,
            self.inner.ring.load().len()
        );
        let this = self.clone();
        self.inner.tracker.spawn(async move { this.gossip_loop().await });
    }

    /// Apply a change to the table, publish the new ring and emit events.
    fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut MemberTable) -> Vec<MembershipEvent>,
    {
        let events = {
            let mut table = self.inner.table.write();
            let version = table.version();
            let before = table.active_ids();

            let events = change(&mut table);

            if table.version() != version {
                *self.inner.last_change.lock() = Instant::now();
            }
            if table.active_ids() != before {
                let ring = Ring::with_nodes(
                    Arc::clone(&self.inner.hasher),
                    self.inner.config.virtual_nodes,
                    table.active(),
                );
                debug!("Ring now has {} members", ring.len());
                self.inner.ring.store(Arc::new(ring));
            }
            events
        };

        for event in events {
            match &event {
                MembershipEvent::NodeJoined(node) => info!("{} joined the ring", node),
                MembershipEvent::NodeLeft(id) => info!("{} left the ring", id),
                MembershipEvent::NodeSuspected(id) => warn!("{} is suspected", id),
                MembershipEvent::NodeRecovered(id) => info!("{} recovered", id),
                MembershipEvent::NodeFailed(id) => warn!("{} failed and was removed", id),
                MembershipEvent::Degraded => {
                    warn!("All peers lost; {} now owns the whole ring", self.inner.address);
                }
            }
            let _ = self.inner.events.send(event);
        }
    }

    async fn gossip_loop(&self) {
        let mut ticker = interval(self.inner.config.gossip_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let peer = {
                let peers = self.peers();
                peers.choose(&mut rand::thread_rng()).cloned()
            };
            if let Some(peer) = peer {
                self.sync_with(&peer).await;
            }
        }

        debug!("Gossip loop of {} stopped", self.inner.address);
    }

    async fn sync_with(&self, peer: &Node) {
        let view = match self.encoded_view() {
            Ok(view) => view,
            Err(e) => {
                warn!("Could not encode view: {}", e);
                return;
            }
        };
        let request = Frame::request(FrameKind::Sync, "", view);
        let address = peer.address();

        let outcome = tokio::select! {
            () = self.inner.shutdown.cancelled() => return,
            outcome = timeout(self.inner.config.probe_timeout(), self.inner.transport.call(&address, request)) => outcome,
        };

        match outcome {
            Ok(Ok(payload)) => match decode::<Vec<Node>>(&payload) {
                Ok(view) => self.update(|table| {
                    let mut events: Vec<_> = table.record_success(peer.id()).into_iter().collect();
                    events.extend(table.merge(view));
                    events
                }),
                Err(e) => warn!("{} sent an unreadable view: {}", peer, e),
            },
            Ok(Err(e)) => {
                debug!("Sync with {} failed: {}", peer, e);
                self.record_failure(peer.id());
            }
            Err(_) => {
                debug!("Sync with {} timed out", peer);
                self.record_failure(peer.id());
            }
        }
    }

    fn record_failure(&self, id: &NodeId) {
        let threshold = self.inner.config.failure_threshold;
        self.update(|table| table.record_failure(id, threshold));
    }

    async fn push_view(&self, peer: Node, view: Bytes) {
        let request = Frame::request(FrameKind::Sync, "", view);
        let address = peer.address();
        match timeout(
            self.inner.config.probe_timeout(),
            self.inner.transport.call(&address, request),
        )
        .await
        {
            Ok(Ok(payload)) => {
                if let Ok(view) = decode::<Vec<Node>>(&payload) {
                    self.update(|table| table.merge(view));
                }
            }
            Ok(Err(e)) => debug!("Pushing view to {} failed: {}", peer, e),
            Err(_) => debug!("Pushing view to {} timed out", peer),
        }
    }
}

impl std::fmt::Debug for RingMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingMembership")
            .field("address", &self.inner.address)
            .field("node_id", &self.inner.local_id)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(value: &T) -> MembershipResult<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| MembershipError::Decode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> MembershipResult<T> {
    ciborium::de::from_reader(payload).map_err(|e| MembershipError::Decode(e.to_string()))
}
