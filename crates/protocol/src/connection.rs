//! A multiplexed connection over any byte stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use crate::codec::{FrameCodec, MAX_FRAME_SIZE};
use crate::error::{CallError, CallResult, ProtocolError};
use crate::frame::{Frame, FrameKind};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How long queued frames may take to flush once a connection is closing.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a single connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Largest accepted frame body.
    pub max_frame_size: usize,
    /// How long a call waits for its acknowledgement.
    pub ack_timeout: Duration,
    /// Capacity of the outbound and inbound queues.
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            ack_timeout: Duration::from_secs(30),
            queue_capacity: 1000,
        }
    }
}

type PendingCall = oneshot::Sender<CallResult<Bytes>>;

struct Inner {
    id: u64,
    peer: String,
    next_correlation_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
    outbound: flume::Sender<Frame>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    ack_timeout: Duration,
    error: Mutex<Option<String>>,
}

impl Inner {
    fn complete(&self, correlation_id: u64, result: CallResult<Bytes>) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            debug!(
                "connection {}: cancelling {} pending calls",
                self.id,
                ids.len()
            );
        }
        for id in ids {
            self.complete(id, Err(CallError::Closed));
        }
    }

    fn record_error(&self, error: &ProtocolError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }
}

/// A multiplexed request/acknowledgement channel.
///
/// Cheap to clone; all clones share the same underlying stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap a byte stream and start its reader and writer tasks.
    ///
    /// Returns the connection and the receiver of inbound requests. Dropping the
    /// receiver makes every inbound request fail with an error acknowledgement.
    pub fn new<S>(stream: S, peer: impl Into<String>, config: &ConnectionConfig) -> (Self, Incoming)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let (outbound_tx, outbound_rx) = flume::bounded(config.queue_capacity);
        let (incoming_tx, incoming_rx) = flume::bounded(config.queue_capacity);

        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            next_correlation_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outbound: outbound_tx,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            ack_timeout: config.ack_timeout,
            error: Mutex::new(None),
        });

        debug!("connection {} to {} opened", inner.id, inner.peer);

        inner
            .tracker
            .spawn(write_loop(Arc::clone(&inner), writer, outbound_rx));
        inner
            .tracker
            .spawn(read_loop(Arc::clone(&inner), reader, incoming_tx));
        inner.tracker.close();

        (Self { inner }, Incoming { rx: incoming_rx })
    }

    /// Process-unique id of this connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Label of the remote end, usually its socket address.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Whether the connection has started closing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// The protocol error that closed this connection, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.inner.error.lock().clone()
    }

    /// Number of calls awaiting acknowledgement.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send a request and wait for its acknowledgement.
    ///
    /// The correlation id of `frame` is overwritten.
    ///
    /// # Errors
    ///
    /// Fails with [`CallError::Remote`] when the peer acknowledges with an
    /// error, [`CallError::Closed`] when the connection closes first,
    /// [`CallError::Timeout`] when no acknowledgement arrives in time, and
    /// [`CallError::Invalid`] when the frame cannot be sent at all.
    pub async fn call(&self, mut frame: Frame) -> CallResult<Bytes> {
        if !frame.kind.is_request() {
            return Err(CallError::Invalid(
                "acknowledgements cannot be sent as calls".to_string(),
            ));
        }
        frame
            .validate()
            .map_err(|e| CallError::Invalid(e.to_string()))?;

        let correlation_id = self.inner.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        frame.correlation_id = correlation_id;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id, tx);

        // The reader drains the table after cancelling; re-check so an entry
        // inserted after that drain is not left behind.
        if self.inner.shutdown.is_cancelled() {
            self.inner.pending.remove(&correlation_id);
            return Err(CallError::Closed);
        }

        trace!(
            "connection {}: call {} {:?} '{}'",
            self.inner.id, correlation_id, frame.kind, frame.topic
        );

        let sent = tokio::select! {
            () = self.inner.shutdown.cancelled() => false,
            sent = self.inner.outbound.send_async(frame) => sent.is_ok(),
        };
        if !sent {
            self.inner.pending.remove(&correlation_id);
            return Err(CallError::Closed);
        }

        match timeout(self.inner.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                self.inner.pending.remove(&correlation_id);
                Err(CallError::Timeout(self.inner.ack_timeout))
            }
        }
    }

    /// Close the connection and wait for its tasks to finish.
    ///
    /// Every pending call completes with [`CallError::Closed`].
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.wait().await;
    }

    /// Wait until the connection has closed and its pending calls are cancelled.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
        self.inner.tracker.wait().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Receiver of inbound requests on a connection.
pub struct Incoming {
    rx: flume::Receiver<InboundCall>,
}

impl Incoming {
    /// Next inbound request, or `None` once the connection has closed.
    pub async fn recv(&self) -> Option<InboundCall> {
        self.rx.recv_async().await.ok()
    }
}

/// A request received from the peer.
#[derive(Debug)]
pub struct InboundCall {
    /// The request frame.
    pub frame: Frame,
    /// Sends the single acknowledgement for this request.
    pub responder: Responder,
}

/// Sends exactly one acknowledgement for an inbound request.
///
/// Dropping it without acknowledging sends an error acknowledgement.
#[derive(Debug)]
pub struct Responder {
    correlation_id: u64,
    outbound: flume::Sender<Frame>,
    acked: bool,
}

impl Responder {
    /// Correlation id being acknowledged.
    #[must_use]
    pub const fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Acknowledge with a payload on success or an error message on failure.
    pub async fn ack(mut self, result: Result<Bytes, String>) {
        self.acked = true;
        let frame = Frame::ack(self.correlation_id, result);
        if self.outbound.send_async(frame).await.is_err() {
            debug!(
                "dropping ack {}: connection closed",
                self.correlation_id
            );
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.acked {
            let frame = Frame::ack(
                self.correlation_id,
                Err("request dropped without acknowledgement".to_string()),
            );
            let _ = self.outbound.try_send(frame);
        }
    }
}

async fn read_loop<R>(
    inner: Arc<Inner>,
    mut reader: FramedRead<R, FrameCodec>,
    incoming: flume::Sender<InboundCall>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) if frame.kind == FrameKind::Ack => {
                let correlation_id = frame.correlation_id;
                let result = match frame.error {
                    Some(error) => Err(CallError::Remote(error)),
                    None => Ok(frame.payload),
                };
                if !inner.complete(correlation_id, result) {
                    debug!(
                        "connection {}: ack for unknown call {}",
                        inner.id, correlation_id
                    );
                }
            }
            Some(Ok(frame)) => {
                let call = InboundCall {
                    responder: Responder {
                        correlation_id: frame.correlation_id,
                        outbound: inner.outbound.clone(),
                        acked: false,
                    },
                    frame,
                };
                tokio::select! {
                    () = inner.shutdown.cancelled() => break,
                    sent = incoming.send_async(call) => {
                        if sent.is_err() {
                            trace!("connection {}: no receiver for inbound requests", inner.id);
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!("connection {} to {}: {}", inner.id, inner.peer, e);
                inner.record_error(&e);
                break;
            }
            None => {
                debug!("connection {} closed by {}", inner.id, inner.peer);
                break;
            }
        }
    }

    inner.shutdown.cancel();
    inner.fail_pending();
}

async fn write_loop<W>(
    inner: Arc<Inner>,
    mut writer: FramedWrite<W, FrameCodec>,
    outbound: flume::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            frame = outbound.recv_async() => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        let kind = frame.kind;
        let correlation_id = frame.correlation_id;

        match writer.send(frame).await {
            Ok(()) => {}
            Err(ProtocolError::Io(e)) => {
                warn!("connection {} to {}: write failed: {}", inner.id, inner.peer, e);
                inner.shutdown.cancel();
                return;
            }
            Err(e) => {
                warn!(
                    "connection {}: dropping unencodable {:?} frame {}: {}",
                    inner.id, kind, correlation_id, e
                );
                if kind.is_request() {
                    inner.complete(correlation_id, Err(CallError::Invalid(e.to_string())));
                } else {
                    let _ = inner
                        .outbound
                        .try_send(Frame::ack(correlation_id, Err(e.to_string())));
                }
            }
        }
    }

    let drain = async {
        while let Ok(frame) = outbound.try_recv() {
            if writer.feed(frame).await.is_err() {
                return;
            }
        }
        let _ = writer.close().await;
    };
    if timeout(FLUSH_TIMEOUT, drain).await.is_err() {
        debug!("connection {}: flush on close timed out", inner.id);
    }

    inner.shutdown.cancel();
    debug!("connection {} to {} closed", inner.id, inner.peer);
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn pair(config: &ConnectionConfig) -> ((Connection, Incoming), (Connection, Incoming)) {
        let (left, right) = duplex(64 * 1024);
        (
            Connection::new(left, "left", config),
            Connection::new(right, "right", config),
        )
    }

    fn publish(topic: &str, payload: &'static [u8]) -> Frame {
        Frame::request(FrameKind::Publish, topic, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        init_tracing();
        let ((client, _client_incoming), (_server, server_incoming)) =
            pair(&ConnectionConfig::default());

        tokio::spawn(async move {
            while let Some(call) = server_incoming.recv().await {
                let reply = Bytes::from(call.frame.payload.to_ascii_uppercase());
                call.responder.ack(Ok(reply)).await;
            }
        });

        let reply = timeout(Duration::from_secs(5), client.call(publish("t", b"hello")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"HELLO"));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_acks_match_by_correlation_id() {
        let ((client, _client_incoming), (_server, server_incoming)) =
            pair(&ConnectionConfig::default());

        tokio::spawn(async move {
            let mut calls = Vec::new();
            while calls.len() < 3 {
                calls.push(server_incoming.recv().await.unwrap());
            }
            for call in calls.into_iter().rev() {
                let topic = Bytes::from(call.frame.topic.clone());
                call.responder.ack(Ok(topic)).await;
            }
        });

        let (a, b, c) = tokio::join!(
            client.call(publish("a", b"1")),
            client.call(publish("b", b"2")),
            client.call(publish("c", b"3")),
        );
        assert_eq!(a.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(b.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(c.unwrap(), Bytes::from_static(b"c"));
    }

    #[tokio::test]
    async fn test_remote_error_is_scoped_to_call() {
        let ((client, _client_incoming), (_server, server_incoming)) =
            pair(&ConnectionConfig::default());

        tokio::spawn(async move {
            while let Some(call) = server_incoming.recv().await {
                if call.frame.topic == "bad" {
                    call.responder.ack(Err("boom".to_string())).await;
                } else {
                    call.responder.ack(Ok(Bytes::new())).await;
                }
            }
        });

        assert_matches!(
            client.call(publish("bad", b"x")).await,
            Err(CallError::Remote(e)) if e == "boom"
        );
        assert!(client.call(publish("good", b"x")).await.is_ok());
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_calls() {
        let ((client, _client_incoming), (_server, server_incoming)) =
            pair(&ConnectionConfig::default());

        let held = tokio::spawn(async move {
            let call = server_incoming.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(call);
        });

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call(publish("t", b"x")).await })
        };

        while client.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        client.close().await;

        let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
        assert_matches!(result, Err(CallError::Closed));
        assert_matches!(client.call(publish("t", b"x")).await, Err(CallError::Closed));
        held.abort();
    }

    #[tokio::test]
    async fn test_peer_close_cancels_pending_calls() {
        let ((client, _client_incoming), (server, server_incoming)) =
            pair(&ConnectionConfig::default());

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call(publish("t", b"x")).await })
        };

        let call = server_incoming.recv().await.unwrap();
        std::mem::forget(call.responder);
        server.close().await;

        let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
        assert_matches!(result, Err(CallError::Closed));
        timeout(Duration::from_secs(5), client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        init_tracing();
        let (left, mut right) = duplex(1024);
        let (conn, incoming) = Connection::new(left, "raw", &ConnectionConfig::default());

        right
            .write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff])
            .await
            .unwrap();

        timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
        assert!(conn.is_closed());
        assert!(conn.error().unwrap().contains("malformed"));
        assert!(incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_topic_closes_connection() {
        let (left, mut right) = duplex(1024);
        let (conn, _incoming) = Connection::new(left, "raw", &ConnectionConfig::default());

        let body = Frame::request(FrameKind::Subscribe, "", Bytes::new())
            .to_cbor()
            .unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let len = (body.len() as u32).to_be_bytes();
        right.write_all(&len).await.unwrap();
        right.write_all(&body).await.unwrap();

        timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
        assert!(conn.error().unwrap().contains("no topic"));
    }

    #[tokio::test]
    async fn test_dropped_responder_sends_error_ack() {
        let ((client, _client_incoming), (_server, server_incoming)) =
            pair(&ConnectionConfig::default());

        tokio::spawn(async move {
            while let Some(call) = server_incoming.recv().await {
                drop(call);
            }
        });

        assert_matches!(
            client.call(publish("t", b"x")).await,
            Err(CallError::Remote(_))
        );
    }

    #[tokio::test]
    async fn test_dropped_incoming_rejects_requests() {
        let ((client, _client_incoming), (_server, server_incoming)) =
            pair(&ConnectionConfig::default());
        drop(server_incoming);

        assert_matches!(
            client.call(publish("t", b"x")).await,
            Err(CallError::Remote(_))
        );
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let config = ConnectionConfig {
            ack_timeout: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let ((client, _client_incoming), (_server, server_incoming)) = pair(&config);

        let held = tokio::spawn(async move {
            let call = server_incoming.recv().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(call);
        });

        assert_matches!(
            client.call(publish("t", b"x")).await,
            Err(CallError::Timeout(_))
        );
        assert_eq!(client.pending_calls(), 0);
        held.abort();
    }

    #[tokio::test]
    async fn test_both_directions_share_one_stream() {
        let ((left, left_incoming), (right, right_incoming)) =
            pair(&ConnectionConfig::default());

        for incoming in [left_incoming, right_incoming] {
            tokio::spawn(async move {
                while let Some(call) = incoming.recv().await {
                    call.responder.ack(Ok(call.frame.payload.clone())).await;
                }
            });
        }

        let (from_left, from_right) = tokio::join!(
            left.call(publish("t", b"from-left")),
            right.call(publish("t", b"from-right")),
        );
        assert_eq!(from_left.unwrap(), Bytes::from_static(b"from-left"));
        assert_eq!(from_right.unwrap(), Bytes::from_static(b"from-right"));
    }

    #[tokio::test]
    async fn test_ack_cannot_be_called() {
        let ((client, _incoming), _server) = pair(&ConnectionConfig::default());
        assert_matches!(
            client.call(Frame::ack(1, Ok(Bytes::new()))).await,
            Err(CallError::Invalid(_))
        );
    }
}
