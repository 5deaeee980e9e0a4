//! Node-local subscriber registry and dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{PubSubError, PubSubResult};
use crate::handler::SubscriptionHandler;
use crate::message::Message;
use crate::topic::{topic_matches, validate_pattern};

/// Identifies one registration in a [`LocalPubSub`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Registration {
    id: SubscriptionId,
    handler: Arc<dyn SubscriptionHandler>,
}

struct Inner {
    registry: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
    wildcards: bool,
}

impl Inner {
    fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write();
        let Some(registrations) = registry.get_mut(topic) else {
            return false;
        };

        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;

        if registrations.is_empty() {
            registry.remove(topic);
        }
        drop(registry);

        if removed {
            debug!("Removed local subscription {} on '{}'", id, topic);
        }
        removed
    }
}

/// In-process emitter for one node's subscribers.
///
/// Matching is by exact topic unless built with [`LocalPubSub::with_wildcards`].
#[derive(Clone)]
pub struct LocalPubSub {
    inner: Arc<Inner>,
}

impl LocalPubSub {
    /// Create an exact-match registry.
    #[must_use]
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Create a registry that treats `*` and `>` segments as wildcards.
    #[must_use]
    pub fn with_wildcards() -> Self {
        Self::build(true)
    }

    fn build(wildcards: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                wildcards,
            }),
        }
    }

    /// Register a handler for `topic`.
    ///
    /// The registration lives until the returned handle is dropped or
    /// [`LocalPubSub::unsubscribe`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::InvalidTopic`] for an empty topic, or for a
    /// malformed pattern when wildcards are enabled.
    pub fn subscribe<H>(&self, topic: &str, handler: H) -> PubSubResult<SubscriptionHandle>
    where
        H: SubscriptionHandler,
    {
        if self.inner.wildcards {
            validate_pattern(topic)?;
        } else if topic.is_empty() {
            return Err(PubSubError::InvalidTopic(topic.to_string()));
        }

        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .registry
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });

        debug!("Added local subscription {} on '{}'", id, topic);

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Remove a registration. Returns whether it existed.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        self.inner.remove(topic, id)
    }

    /// Number of registrations made under exactly `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.registry.read().get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one registration.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.inner.registry.read().keys().cloned().collect()
    }

    fn matching_handlers(&self, topic: &str) -> Vec<Arc<dyn SubscriptionHandler>> {
        let registry = self.inner.registry.read();
        if self.inner.wildcards {
            registry
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, topic))
                .flat_map(|(_, registrations)| registrations.iter())
                .map(|r| Arc::clone(&r.handler))
                .collect()
        } else {
            registry
                .get(topic)
                .map(|registrations| {
                    registrations
                        .iter()
                        .map(|r| Arc::clone(&r.handler))
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    /// Deliver `message` to every matching subscriber and wait for all of them.
    ///
    /// Handlers run concurrently. Every subscriber receives the message even if
    /// another fails; the first error to complete is returned. With no
    /// subscribers this resolves immediately. On success, returns how many
    /// subscribers acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Delivery`] with the first subscriber error.
    pub async fn publish_local(&self, message: Message) -> PubSubResult<usize> {
        let handlers = self.matching_handlers(&message.topic);
        if handlers.is_empty() {
            trace!("No local subscribers for '{}'", message.topic);
            return Ok(0);
        }

        let count = handlers.len();
        let mut acks: FuturesUnordered<_> = handlers
            .into_iter()
            .map(|handler| {
                let message = message.clone();
                async move { handler.handle(message).await }
            })
            .collect();

        let mut first_error = None;
        while let Some(result) = acks.next().await {
            if let Err(e) = result {
                debug!("Subscriber of '{}' failed: {}", message.topic, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(PubSubError::Delivery(e)),
            None => Ok(count),
        }
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalPubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPubSub")
            .field("topics", &self.inner.registry.read().len())
            .field("wildcards", &self.inner.wildcards)
            .finish()
    }
}

/// Keeps a registration alive; dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: String,
    inner: Weak<Inner>,
}

impl SubscriptionHandle {
    /// Registration id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Topic or pattern subscribed to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(&self.topic, self.id);
        }
    }
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}
