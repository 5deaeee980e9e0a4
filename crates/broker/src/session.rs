//! Serves the requests arriving on one connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use ringmq_protocol::{Connection, Frame, FrameKind, InboundCall, Incoming};
use ringmq_pubsub::{HandlerError, Message, SubscriptionHandle, SubscriptionHandler};
use ringmq_ring::NodeId;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::context::NodeContext;
use crate::error::BrokerError;

/// Local subscriber that forwards each message to a client connection.
struct ConnectionSubscriber {
    connection: Connection,
}

#[async_trait]
impl SubscriptionHandler for ConnectionSubscriber {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let frame = Frame::request(FrameKind::Deliver, message.topic, message.payload);
        self.connection
            .call(frame)
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::new(format!("{}: {e}", self.connection.peer())))
    }
}

/// Place of a client subscribe or unsubscribe in its topic's queue.
struct Turn {
    topic: String,
    ticket: u64,
    /// Completes when the previous change to the topic is done.
    previous: Option<oneshot::Receiver<()>>,
    /// Dropped once this change is done.
    done: oneshot::Sender<()>,
}

/// State of one connection, client or peer.
pub struct Session {
    context: Arc<NodeContext>,
    connection: Connection,
    /// Client subscriptions made over this connection.
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
    /// Latest queued subscription change per topic.
    turns: DashMap<String, (u64, oneshot::Receiver<()>)>,
    next_ticket: AtomicU64,
    tasks: TaskTracker,
}

impl Session {
    pub fn new(context: Arc<NodeContext>, connection: Connection) -> Self {
        Self {
            context,
            connection,
            subscriptions: Mutex::new(HashMap::new()),
            turns: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            tasks: TaskTracker::new(),
        }
    }

    /// Handle requests until the connection or the node shuts down, then
    /// release everything the connection registered.
    pub async fn run(self: Arc<Self>, incoming: Incoming) {
        loop {
            let call = tokio::select! {
                () = self.context.shutdown.cancelled() => break,
                call = incoming.recv() => call,
            };
            let Some(call) = call else {
                break;
            };

            // Subscription changes to one topic apply in arrival order.
            let turn = self.take_turn(&call.frame);
            let this = Arc::clone(&self);
            self.tasks.spawn(async move {
                let Some(turn) = turn else {
                    return this.handle(call).await;
                };
                if let Some(previous) = turn.previous {
                    let _ = previous.await;
                }
                this.handle(call).await;
                this.turns
                    .remove_if(&turn.topic, |_, (ticket, _)| *ticket == turn.ticket);
                drop(turn.done);
            });
        }
        drop(incoming);

        if self.context.shutdown.is_cancelled() {
            self.connection.close().await;
        }
        self.tasks.close();
        self.tasks.wait().await;

        self.cleanup().await;
        self.connection.close().await;
    }

    fn take_turn(&self, frame: &Frame) -> Option<Turn> {
        let client_change = matches!(frame.kind, FrameKind::Subscribe | FrameKind::Unsubscribe)
            && frame.origin.is_none();
        if !client_change {
            return None;
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (done, finished) = oneshot::channel();
        let previous = self
            .turns
            .insert(frame.topic.clone(), (ticket, finished))
            .map(|(_, previous)| previous);
        Some(Turn {
            topic: frame.topic.clone(),
            ticket,
            previous,
            done,
        })
    }

    async fn handle(&self, call: InboundCall) {
        let InboundCall { frame, responder } = call;
        let Frame {
            kind,
            topic,
            payload,
            origin,
            ..
        } = frame;
        trace!(
            "connection {}: {:?} '{}'",
            self.connection.id(),
            kind,
            topic
        );

        let result = match kind {
            FrameKind::Publish => self
                .context
                .publisher
                .publish(Message::new(topic, payload), origin.as_deref())
                .await
                .map(|()| Bytes::new())
                .map_err(BrokerError::into_ack),
            FrameKind::Deliver => self
                .context
                .local
                .publish_local(Message::new(topic, payload))
                .await
                .map(|_| Bytes::new())
                .map_err(|e| BrokerError::from(e).into_ack()),
            FrameKind::Subscribe => match origin {
                Some(node) => Ok(self.add_interest(NodeId::new(node), &topic)),
                None => self.subscribe(&topic).await,
            },
            FrameKind::Unsubscribe => match origin {
                Some(node) => Ok(self.remove_interest(&NodeId::new(node), &topic)),
                None => Ok(self.unsubscribe(&topic).await),
            },
            FrameKind::Join => self
                .context
                .membership
                .handle_join(&payload)
                .map_err(|e| e.to_string()),
            FrameKind::Sync => self
                .context
                .membership
                .handle_sync(&payload)
                .map_err(|e| e.to_string()),
            FrameKind::Leave => self
                .context
                .membership
                .handle_leave(&payload)
                .map_err(|e| e.to_string()),
            FrameKind::Ack => Err("unexpected acknowledgement".to_string()),
        };

        responder.ack(result).await;
    }

    async fn subscribe(&self, topic: &str) -> Result<Bytes, String> {
        if self.subscriptions.lock().contains_key(topic) {
            return Ok(Bytes::new());
        }

        let subscriber = ConnectionSubscriber {
            connection: self.connection.clone(),
        };
        let handle = self
            .context
            .local
            .subscribe(topic, subscriber)
            .map_err(|e| e.to_string())?;

        if let Err(e) = self.context.propagation.acquire(topic).await {
            warn!("Subscription to '{}' failed: {}", topic, e);
            return Err(e.to_string());
        }

        let replaced = self.subscriptions.lock().insert(topic.to_string(), handle);
        if replaced.is_some() {
            self.context.propagation.release(topic).await;
        }

        debug!(
            "connection {} subscribed to '{}'",
            self.connection.id(),
            topic
        );
        Ok(Bytes::new())
    }

    async fn unsubscribe(&self, topic: &str) -> Bytes {
        let removed = self.subscriptions.lock().remove(topic);
        if let Some(handle) = removed {
            drop(handle);
            self.context.propagation.release(topic).await;
            debug!(
                "connection {} unsubscribed from '{}'",
                self.connection.id(),
                topic
            );
        }
        Bytes::new()
    }

    fn add_interest(&self, node: NodeId, topic: &str) -> Bytes {
        self.context
            .interests
            .add(node, topic, self.connection.clone());
        Bytes::new()
    }

    fn remove_interest(&self, node: &NodeId, topic: &str) -> Bytes {
        self.context.interests.remove(node, topic);
        Bytes::new()
    }

    async fn cleanup(&self) {
        if let Some(error) = self.connection.error() {
            warn!(
                "connection {} to {} closed: {}",
                self.connection.id(),
                self.connection.peer(),
                BrokerError::Protocol(error)
            );
        }

        // On shutdown the owners drop our interest with the pooled connection.
        let shutting_down = self.context.shutdown.is_cancelled();
        let subscriptions: Vec<(String, SubscriptionHandle)> =
            self.subscriptions.lock().drain().collect();
        for (topic, handle) in subscriptions {
            drop(handle);
            if !shutting_down {
                self.context.propagation.release(&topic).await;
            }
        }

        let id = self.connection.id();
        let removed = self.context.interests.remove_where(|sink| sink.id() == id);
        if !removed.is_empty() {
            debug!(
                "connection {}: dropped {} remote interests",
                id,
                removed.len()
            );
        }

        self.context.connections.remove(&id);
    }
}
