use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use ringmq_protocol::{Connection, ConnectionConfig, Frame, FrameKind, InboundCall, Incoming};
use ringmq_pubsub::{Message, SubscriptionHandler};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};

/// Client settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long connecting may take.
    pub connect_timeout: Duration,
    /// Frame limit and acknowledgement timeout.
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

type Handlers = DashMap<String, Arc<dyn SubscriptionHandler>>;

struct Inner {
    connection: Connection,
    handlers: Handlers,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// A connection to one broker node.
///
/// Cheap to clone. Calls may be issued concurrently; each resolves when the
/// broker acknowledges it.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connect to a broker interface with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the broker cannot be reached.
    pub async fn connect(address: &str) -> ClientResult<Self> {
        Self::connect_with(address, ClientConfig::default()).await
    }

    /// Connect to a broker interface.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the broker cannot be reached in
    /// time.
    pub async fn connect_with(address: &str, config: ClientConfig) -> ClientResult<Self> {
        let failed = |reason: String| ClientError::Connect {
            address: address.to_string(),
            reason,
        };

        let stream = timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| failed(format!("no connection within {:?}", config.connect_timeout)))?
            .map_err(|e| failed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| failed(e.to_string()))?;

        debug!("Connected to broker at {}", address);
        Ok(Self::from_stream(stream, address, &config.connection))
    }

    /// Run a client over an already connected stream.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>, config: &ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, incoming) = Connection::new(stream, peer, config);
        let inner = Arc::new(Inner {
            connection,
            handlers: DashMap::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        inner
            .tracker
            .spawn(dispatch_loop(Arc::clone(&inner), incoming));

        Self { inner }
    }

    /// Publish `payload` to `topic`.
    ///
    /// Resolves once every subscriber in the cluster acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Call`] with the broker's delivery error, or if the
    /// connection closed or timed out first.
    pub async fn emit(&self, topic: &str, payload: impl Into<Bytes>) -> ClientResult<()> {
        let frame = Frame::request(FrameKind::Publish, topic, payload);
        self.inner.connection.call(frame).await?;
        Ok(())
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// Resolves once the broker confirmed the registration. Each delivered
    /// message is acknowledged when the handler returns. Subscribing again
    /// replaces the handler.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Call`] if the broker rejected the registration.
    pub async fn on<H>(&self, topic: &str, handler: H) -> ClientResult<()>
    where
        H: SubscriptionHandler,
    {
        let previous = self
            .inner
            .handlers
            .insert(topic.to_string(), Arc::new(handler));

        let frame = Frame::request(FrameKind::Subscribe, topic, Bytes::new());
        if let Err(e) = self.inner.connection.call(frame).await {
            match previous {
                Some(previous) => {
                    self.inner.handlers.insert(topic.to_string(), previous);
                }
                None => {
                    self.inner.handlers.remove(topic);
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Unsubscribe from `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Call`] if the broker did not acknowledge.
    pub async fn off(&self, topic: &str) -> ClientResult<()> {
        let frame = Frame::request(FrameKind::Unsubscribe, topic, Bytes::new());
        let result = self.inner.connection.call(frame).await;
        self.inner.handlers.remove(topic);
        result?;
        Ok(())
    }

    /// Topics with a registered handler.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.inner
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.connection.is_closed()
    }

    /// Close the connection. Pending calls fail with
    /// [`ringmq_protocol::CallError::Closed`].
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.connection.close().await;
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Wait until the broker closes the connection.
    pub async fn closed(&self) {
        self.inner.connection.closed().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.inner.connection)
            .field("topics", &self.inner.handlers.len())
            .finish()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, incoming: Incoming) {
    loop {
        let call = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            call = incoming.recv() => call,
        };
        let Some(call) = call else {
            break;
        };

        let handler = (call.frame.kind == FrameKind::Deliver)
            .then(|| inner.handlers.get(&call.frame.topic).map(|h| Arc::clone(h.value())))
            .flatten();
        inner.tracker.spawn(deliver(call, handler));
    }
    debug!("Client dispatch loop stopped");
}

async fn deliver(call: InboundCall, handler: Option<Arc<dyn SubscriptionHandler>>) {
    let InboundCall { frame, responder } = call;

    if frame.kind != FrameKind::Deliver {
        responder
            .ack(Err(format!("clients do not accept {:?} requests", frame.kind)))
            .await;
        return;
    }

    let Some(handler) = handler else {
        trace!("Delivery on '{}' after unsubscribing", frame.topic);
        responder.ack(Ok(Bytes::new())).await;
        return;
    };

    let result = handler
        .handle(Message::new(frame.topic, frame.payload))
        .await
        .map(|()| Bytes::new())
        .map_err(|e| e.to_string());
    responder.ack(result).await;
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use ringmq_protocol::CallError;
    use ringmq_pubsub::{HandlerError, handler_fn};
    use tokio::io::duplex;

    use super::*;

    /// Broker stand-in: acknowledges everything and records what it saw.
    fn fake_broker() -> (Client, Connection, Arc<Mutex<Vec<Frame>>>) {
        let (left, right) = duplex(64 * 1024);
        let client = Client::from_stream(left, "broker", &ConnectionConfig::default());
        let (broker, incoming) = Connection::new(right, "client", &ConnectionConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Some(call) = incoming.recv().await {
                let reply = if call.frame.topic == "forbidden" {
                    Err("not allowed".to_string())
                } else {
                    Ok(Bytes::new())
                };
                record.lock().push(call.frame);
                call.responder.ack(reply).await;
            }
        });

        (client, broker, seen)
    }

    #[tokio::test]
    async fn test_emit_sends_publish() {
        let (client, _broker, seen) = fake_broker();

        client.emit("orders", "hello").await.unwrap();

        let frames = seen.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Publish);
        assert_eq!(frames[0].topic, "orders");
        assert_eq!(frames[0].payload, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_emit_reports_broker_error() {
        let (client, _broker, _seen) = fake_broker();
        assert_matches!(
            client.emit("forbidden", "x").await,
            Err(ClientError::Call(CallError::Remote(e))) if e == "not allowed"
        );
    }

    #[tokio::test]
    async fn test_deliveries_reach_handler_and_ack() {
        let (client, broker, _seen) = fake_broker();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client
            .on(
                "orders",
                handler_fn(move |message: Message| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push(message.payload);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(client.topics(), vec!["orders".to_string()]);

        broker
            .call(Frame::request(FrameKind::Deliver, "orders", Bytes::from_static(b"m1")))
            .await
            .unwrap();
        assert_eq!(*received.lock(), vec![Bytes::from_static(b"m1")]);
    }

    #[tokio::test]
    async fn test_handler_error_is_acked_as_error() {
        let (client, broker, _seen) = fake_broker();
        client
            .on(
                "orders",
                handler_fn(|_message: Message| async { Err(HandlerError::new("rejected")) }),
            )
            .await
            .unwrap();

        assert_matches!(
            broker
                .call(Frame::request(FrameKind::Deliver, "orders", Bytes::new()))
                .await,
            Err(CallError::Remote(e)) if e == "rejected"
        );
    }

    #[tokio::test]
    async fn test_failed_subscribe_forgets_handler() {
        let (client, _broker, _seen) = fake_broker();
        let result = client
            .on("forbidden", handler_fn(|_message: Message| async { Ok(()) }))
            .await;

        assert_matches!(result, Err(ClientError::Call(CallError::Remote(_))));
        assert!(client.topics().is_empty());
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let (client, _broker, seen) = fake_broker();
        client
            .on("orders", handler_fn(|_message: Message| async { Ok(()) }))
            .await
            .unwrap();
        client.off("orders").await.unwrap();

        assert!(client.topics().is_empty());
        let kinds: Vec<FrameKind> = seen.lock().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameKind::Subscribe, FrameKind::Unsubscribe]);
    }

    #[tokio::test]
    async fn test_close_fails_later_calls() {
        let (client, _broker, _seen) = fake_broker();
        client.close().await;

        assert!(client.is_closed());
        assert_matches!(
            client.emit("orders", "x").await,
            Err(ClientError::Call(CallError::Closed))
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert_matches!(
            Client::connect(&address).await,
            Err(ClientError::Connect { .. })
        );
    }
}
