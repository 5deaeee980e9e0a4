//! The broker facade and its lifecycle.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use ringmq_membership::{MembershipEvent, RingMembership};
use ringmq_ring::{TopicHasher, XxTopicHasher};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::BrokerConfig;
use crate::context::NodeContext;
use crate::error::{BrokerError, BrokerResult};
use crate::pool::PeerPool;

/// Lifecycle state of a broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BrokerState {
    /// Built but not started.
    Created,
    /// Listening and joining the ring.
    Joining,
    /// Joined and serving.
    Ready,
    /// Stopping.
    Closing,
    /// Stopped; final.
    Closed,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Joining => "joining",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications of a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Client interfaces are bound, in configuration order.
    Listening(Vec<SocketAddr>),
    /// The ring join completed.
    Ready,
    /// Cluster membership changed.
    Membership(MembershipEvent),
    /// The broker stopped.
    Closed,
}

struct Running {
    context: Arc<NodeContext>,
    listeners: Vec<JoinHandle<BrokerResult<()>>>,
    interfaces: Vec<SocketAddr>,
    ring_address: SocketAddr,
}

struct Inner {
    config: BrokerConfig,
    hasher: Arc<dyn TopicHasher>,
    state: watch::Sender<BrokerState>,
    events: broadcast::Sender<BrokerEvent>,
    running: Mutex<Option<Running>>,
}

/// One node of a ringmq cluster.
///
/// `start` binds the ring listener and every client interface, joins the
/// ring through the configured seeds and reports ready. `stop` announces
/// departure, closes the listeners and every connection, and resolves once
/// all of it is released.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Create a broker hashing topics with xxHash64.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hasher(config, Arc::new(XxTopicHasher::default()))
    }

    /// Create a broker with a custom topic hasher. Every node of a cluster
    /// must use the same one.
    #[must_use]
    pub fn with_hasher(config: BrokerConfig, hasher: Arc<dyn TopicHasher>) -> Self {
        let (state, _) = watch::channel(BrokerState::Created);
        let (events, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(Inner {
                config,
                hasher,
                state,
                events,
                running: Mutex::new(None),
            }),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BrokerState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<BrokerState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to lifecycle notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Bound client interface addresses, once listening.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|running| running.interfaces.clone())
            .unwrap_or_default()
    }

    /// Bound ring address, once listening. Other nodes use it as a seed.
    #[must_use]
    pub fn ring_address(&self) -> Option<SocketAddr> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|running| running.ring_address)
    }

    /// Ring membership, once listening.
    #[must_use]
    pub fn membership(&self) -> Option<RingMembership> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|running| running.context.membership.clone())
    }

    /// Start the broker and wait until it is ready.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Configuration`] for an invalid configuration,
    /// [`BrokerError::Io`] if a listener cannot be bound, and
    /// [`BrokerError::RingJoinTimeout`] if no seed admits this node. The
    /// broker is closed after any of them. Starting twice is
    /// [`BrokerError::InvalidState`].
    pub async fn start(&self) -> BrokerResult<()> {
        self.transition(&[BrokerState::Created], BrokerState::Joining, "start")?;

        match self.launch().await {
            Ok(()) => {
                self.inner.state.send_replace(BrokerState::Ready);
                let _ = self.inner.events.send(BrokerEvent::Ready);
                Ok(())
            }
            Err(e) => {
                error!("Broker failed to start: {}", e);
                let running = self.inner.running.lock().take();
                if let Some(running) = running {
                    let _ = release(running).await;
                }
                self.finish();
                Err(e)
            }
        }
    }

    async fn launch(&self) -> BrokerResult<()> {
        let config = &self.inner.config;
        config.validate()?;

        let ring_listener = TcpListener::bind(config.ring_bind_address()).await?;
        let ring_address = ring_listener.local_addr()?;

        let mut interface_listeners = Vec::with_capacity(config.interfaces.len());
        for interface in &config.interfaces {
            let listener = TcpListener::bind(interface.bind_address()).await?;
            interface_listeners.push(listener);
        }
        let interfaces = interface_listeners
            .iter()
            .map(TcpListener::local_addr)
            .collect::<Result<Vec<_>, _>>()?;

        let connection_config = config.protocol.connection_config();
        let (pool, dialed) =
            PeerPool::new(connection_config.clone(), config.protocol.connect_timeout());
        let membership = RingMembership::new(
            config.ring.clone(),
            ring_address.to_string(),
            Arc::clone(&self.inner.hasher),
            Arc::new(pool.clone()),
        )
        .map_err(|e| BrokerError::Configuration(e.to_string()))?;

        let context = Arc::new(NodeContext::new(membership, pool, connection_config));

        let mut listeners = Vec::with_capacity(interfaces.len() + 1);
        listeners.push(
            context
                .tracker
                .spawn(Arc::clone(&context).accept_loop(ring_listener, "ring")),
        );
        for listener in interface_listeners {
            listeners.push(
                context
                    .tracker
                    .spawn(Arc::clone(&context).accept_loop(listener, "client")),
            );
        }
        context
            .tracker
            .spawn(Arc::clone(&context).serve_dialed(dialed));
        context.tracker.spawn(Arc::clone(&context).watch_cluster(
            context.membership.events(),
            context.pool.events(),
            self.inner.events.clone(),
        ));

        *self.inner.running.lock() = Some(Running {
            context: Arc::clone(&context),
            listeners,
            interfaces: interfaces.clone(),
            ring_address,
        });

        info!(
            "Listening on {:?}, ring on {}",
            interfaces, ring_address
        );
        let _ = self.inner.events.send(BrokerEvent::Listening(interfaces));

        context
            .membership
            .join(&config.base, config.ring.join_timeout())
            .await?;

        info!("Broker {} ready", context.membership.node_id());
        Ok(())
    }

    /// Stop the broker.
    ///
    /// Announces departure to the ring, closes every listener and connection
    /// and resolves once all of them are released, with the first error any of
    /// them reported. Pending calls fail with a delivery error.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidState`] unless the broker is created or
    /// ready, otherwise the first error met while releasing resources.
    pub async fn stop(&self) -> BrokerResult<()> {
        let previous = self.transition(
            &[BrokerState::Created, BrokerState::Ready],
            BrokerState::Closing,
            "stop",
        )?;
        info!("Broker stopping");

        let running = self.inner.running.lock().take();
        let result = match (previous, running) {
            (BrokerState::Ready, Some(running)) => release(running).await,
            _ => Ok(()),
        };

        self.finish();
        result
    }

    /// Wait until the broker has closed.
    pub async fn wait(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state == BrokerState::Closed).await;
    }

    fn finish(&self) {
        self.inner.state.send_replace(BrokerState::Closed);
        let _ = self.inner.events.send(BrokerEvent::Closed);
        info!("Broker closed");
    }

    fn transition(
        &self,
        allowed: &[BrokerState],
        to: BrokerState,
        operation: &'static str,
    ) -> BrokerResult<BrokerState> {
        let mut outcome = Err(BrokerError::InvalidState {
            operation,
            state: to,
        });
        self.inner.state.send_if_modified(|state| {
            if allowed.contains(state) {
                outcome = Ok(*state);
                *state = to;
                true
            } else {
                outcome = Err(BrokerError::InvalidState {
                    operation,
                    state: *state,
                });
                false
            }
        });
        outcome
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("state", &self.state())
            .field("interfaces", &self.local_addrs())
            .finish_non_exhaustive()
    }
}

/// Leave the ring, then close listeners, connections and the peer pool.
async fn release(running: Running) -> BrokerResult<()> {
    let Running {
        context, listeners, ..
    } = running;

    context.membership.leave().await;
    context.shutdown.cancel();
    context.tracker.close();

    let mut first_error = None;
    for listener in listeners {
        let outcome = match listener.await {
            Ok(outcome) => outcome,
            Err(e) => Err(BrokerError::Io(std::io::Error::other(e))),
        };
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }

    context.tracker.wait().await;
    context.pool.close().await;

    let open = context.connections.len();
    if open > 0 {
        error!("{} connections still registered after shutdown", open);
    }

    first_error.map_or(Ok(()), Err)
}
