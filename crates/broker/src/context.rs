//! Components shared by every connection of a running node.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ringmq_membership::{MembershipEvent, RingMembership};
use ringmq_protocol::{Connection, ConnectionConfig, Incoming};
use ringmq_pubsub::{InterestTracker, LocalPubSub};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broker::BrokerEvent;
use crate::error::BrokerResult;
use crate::interest::InterestPropagation;
use crate::pool::{Dialed, PeerPool, PoolEvent};
use crate::publisher::ClusterPublisher;
use crate::session::Session;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct NodeContext {
    pub membership: RingMembership,
    pub local: LocalPubSub,
    /// Remote nodes interested in topics this node owns.
    pub interests: InterestTracker<Connection>,
    pub propagation: InterestPropagation,
    pub publisher: ClusterPublisher,
    pub pool: PeerPool,
    pub connection_config: ConnectionConfig,
    /// Every open connection, by id.
    pub connections: DashMap<u64, Connection>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

impl NodeContext {
    pub fn new(
        membership: RingMembership,
        pool: PeerPool,
        connection_config: ConnectionConfig,
    ) -> Self {
        let local = LocalPubSub::new();
        let interests = InterestTracker::new();
        let propagation = InterestPropagation::new(membership.clone(), pool.clone());
        let publisher = ClusterPublisher::new(
            membership.clone(),
            local.clone(),
            interests.clone(),
            pool.clone(),
        );

        Self {
            membership,
            local,
            interests,
            propagation,
            publisher,
            pool,
            connection_config,
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Serve the requests of a connection until it closes.
    pub fn serve(self: &Arc<Self>, connection: Connection, incoming: Incoming) {
        self.connections.insert(connection.id(), connection.clone());
        let session = Arc::new(Session::new(Arc::clone(self), connection));
        self.tracker.spawn(session.run(incoming));
    }

    /// Accept connections until shutdown. The listener closes when this returns.
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        label: &'static str,
    ) -> BrokerResult<()> {
        let address: SocketAddr = listener.local_addr()?;

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted {} connection from {}", label, peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle for {}: {}", peer, e);
                    }
                    let (connection, incoming) =
                        Connection::new(stream, peer.to_string(), &self.connection_config);
                    self.serve(connection, incoming);
                }
                Err(e) => {
                    warn!("Failed to accept {} connection on {}: {}", label, address, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!("{} listener on {} closed", label, address);
        Ok(())
    }

    /// Serve the connections this node dialed itself.
    pub async fn serve_dialed(self: Arc<Self>, dialed: flume::Receiver<Dialed>) {
        loop {
            let next = tokio::select! {
                () = self.shutdown.cancelled() => break,
                next = dialed.recv_async() => next,
            };
            match next {
                Ok((connection, incoming)) => self.serve(connection, incoming),
                Err(_) => break,
            }
        }
    }

    /// Re-home interest on membership and connection changes, and relay
    /// membership events to broker subscribers.
    pub async fn watch_cluster(
        self: Arc<Self>,
        mut membership_events: broadcast::Receiver<MembershipEvent>,
        mut pool_events: broadcast::Receiver<PoolEvent>,
        notify: broadcast::Sender<BrokerEvent>,
    ) {
        loop {
            let rebalance = tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = membership_events.recv() => match event {
                    Ok(event) => {
                        let changes_ring = !matches!(
                            event,
                            MembershipEvent::NodeSuspected(_) | MembershipEvent::NodeRecovered(_)
                        );
                        let _ = notify.send(BrokerEvent::Membership(event));
                        changes_ring
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} membership events", missed);
                        true
                    }
                    Err(RecvError::Closed) => break,
                },
                event = pool_events.recv() => match event {
                    Ok(PoolEvent::Disconnected(address)) => {
                        tokio::select! {
                            () = self.shutdown.cancelled() => break,
                            () = self.propagation.on_peer_disconnected(&address) => {}
                        }
                        false
                    }
                    Ok(PoolEvent::Connected(_)) => false,
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => break,
                },
            };

            if rebalance {
                tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    () = self.propagation.rebalance() => {}
                }
            }
        }
        debug!("Cluster watcher stopped");
    }
}
