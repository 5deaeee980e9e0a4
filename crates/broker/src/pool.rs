//! Outbound connections to other nodes, keyed by ring address.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ringmq_membership::MembershipTransport;
use ringmq_protocol::{CallError, CallResult, Connection, ConnectionConfig, Frame, Incoming};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};

/// Connection lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    /// A connection to the address was established.
    Connected(String),
    /// The connection to the address was lost.
    Disconnected(String),
}

/// A freshly dialed connection whose inbound requests still need serving.
pub type Dialed = (Connection, Incoming);

struct Inner {
    connections: DashMap<String, Connection>,
    /// One dial at a time per address.
    dialing: DashMap<String, Arc<Mutex<()>>>,
    config: ConnectionConfig,
    connect_timeout: Duration,
    dialed: flume::Sender<Dialed>,
    events: broadcast::Sender<PoolEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Reuses one connection per peer and redials lost ones on demand.
#[derive(Clone)]
pub struct PeerPool {
    inner: Arc<Inner>,
}

impl PeerPool {
    /// Create an empty pool.
    ///
    /// Every new connection is also sent on the returned receiver so the
    /// caller can serve requests the peer sends back over it.
    #[must_use]
    pub fn new(config: ConnectionConfig, connect_timeout: Duration) -> (Self, flume::Receiver<Dialed>) {
        let (dialed_tx, dialed_rx) = flume::unbounded();
        let (events, _) = broadcast::channel(256);

        let pool = Self {
            inner: Arc::new(Inner {
                connections: DashMap::new(),
                dialing: DashMap::new(),
                config,
                connect_timeout,
                dialed: dialed_tx,
                events,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };
        (pool, dialed_rx)
    }

    /// Subscribe to connection lifecycle notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Addresses with an open connection.
    #[must_use]
    pub fn connected(&self) -> Vec<String> {
        self.inner
            .connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get the open connection to `address`, dialing if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connection`] if the pool is closed or the dial
    /// fails or times out.
    pub async fn get(&self, address: &str) -> BrokerResult<Connection> {
        if let Some(connection) = self.existing(address) {
            return Ok(connection);
        }

        let lock = Arc::clone(
            self.inner
                .dialing
                .entry(address.to_string())
                .or_default()
                .value(),
        );
        let _guard = lock.lock().await;

        // Another caller may have finished dialing while we waited.
        if let Some(connection) = self.existing(address) {
            return Ok(connection);
        }
        self.dial(address).await
    }

    fn existing(&self, address: &str) -> Option<Connection> {
        self.inner
            .connections
            .get(address)
            .filter(|connection| !connection.is_closed())
            .map(|connection| connection.clone())
    }

    async fn dial(&self, address: &str) -> BrokerResult<Connection> {
        let failed = |reason: String| BrokerError::Connection {
            address: address.to_string(),
            reason,
        };

        if self.inner.shutdown.is_cancelled() {
            return Err(failed("pool is closed".to_string()));
        }

        debug!("Dialing {}", address);
        let stream = match timeout(self.inner.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => {
                return Err(failed(format!(
                    "no connection within {:?}",
                    self.inner.connect_timeout
                )));
            }
        };
        stream.set_nodelay(true)?;

        let (connection, incoming) = Connection::new(stream, address, &self.inner.config);
        self.inner
            .connections
            .insert(address.to_string(), connection.clone());

        if self.inner.dialed.send((connection.clone(), incoming)).is_err() {
            debug!("No server for requests on connection to {}", address);
        }

        info!("Connected to {}", address);
        let _ = self
            .inner
            .events
            .send(PoolEvent::Connected(address.to_string()));

        let inner = Arc::clone(&self.inner);
        let watched = connection.clone();
        let address = address.to_string();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                () = watched.closed() => {}
                () = inner.shutdown.cancelled() => return,
            }
            inner
                .connections
                .remove_if(&address, |_, current| current.id() == watched.id());
            info!("Lost connection to {}", address);
            let _ = inner.events.send(PoolEvent::Disconnected(address));
        });

        Ok(connection)
    }

    /// Close every connection and stop watching them.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        let connections: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.connections.clear();

        futures::future::join_all(connections.iter().map(Connection::close)).await;
        self.inner.tracker.wait().await;
        debug!("Peer pool closed");
    }
}

#[async_trait]
impl MembershipTransport for PeerPool {
    async fn call(&self, address: &str, frame: Frame) -> CallResult<Bytes> {
        let connection = self.get(address).await.map_err(|e| {
            debug!("{}", e);
            CallError::Closed
        })?;
        connection.call(frame).await
    }
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("connections", &self.inner.connections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ringmq_protocol::FrameKind;
    use tokio::net::TcpListener;

    use super::*;

    async fn echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = listener.accept().await.unwrap();
                let (connection, incoming) =
                    Connection::new(stream, peer.to_string(), &ConnectionConfig::default());
                tokio::spawn(async move {
                    while let Some(call) = incoming.recv().await {
                        call.responder.ack(Ok(call.frame.payload.clone())).await;
                    }
                    drop(connection);
                });
            }
        });
        (address, handle)
    }

    fn pool() -> (PeerPool, flume::Receiver<Dialed>) {
        PeerPool::new(ConnectionConfig::default(), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (address, server) = echo_server().await;
        let (pool, dialed) = pool();

        let (a, b) = tokio::join!(pool.get(&address), pool.get(&address));
        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(dialed.len(), 1);
        assert_eq!(pool.connected(), vec![address.clone()]);

        let reply = MembershipTransport::call(
            &pool,
            &address,
            Frame::request(FrameKind::Sync, "", Bytes::from_static(b"view")),
        )
        .await
        .unwrap();
        assert_eq!(reply, Bytes::from_static(b"view"));

        pool.close().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (pool, _dialed) = pool();
        assert_matches!(
            pool.get(&address).await,
            Err(BrokerError::Connection { address: failed, .. }) if failed == address
        );
        assert_matches!(
            MembershipTransport::call(&pool, &address, Frame::request(FrameKind::Sync, "", Bytes::new())).await,
            Err(CallError::Closed)
        );
    }

    #[tokio::test]
    async fn test_lost_connection_is_reported_and_redialed() {
        let (address, server) = echo_server().await;
        let (pool, _dialed) = pool();
        let mut events = pool.events();

        let first = pool.get(&address).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            PoolEvent::Connected(address.clone())
        );

        first.close().await;
        assert_eq!(
            events.recv().await.unwrap(),
            PoolEvent::Disconnected(address.clone())
        );

        let second = pool.get(&address).await.unwrap();
        assert_ne!(first.id(), second.id());

        pool.close().await;
        assert!(second.is_closed());
        assert_matches!(pool.get(&address).await, Err(BrokerError::Connection { .. }));
        server.abort();
    }
}
