use std::future::Future;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::message::Message;

/// A local subscriber.
///
/// Returning from `handle` is the subscriber's acknowledgement; it may
/// complete in any order relative to other subscribers of the same message.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// Handle one message.
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

/// Subscriber backed by an async closure. Built with [`handler_fn`].
#[derive(Clone, Debug)]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`SubscriptionHandler`].
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> SubscriptionHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self.f)(message).await
    }
}
