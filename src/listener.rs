//! # Listener contract: where deliveries leave the container.
//!
//! Two trait shapes are exposed:
//! - [`MessageListener`] receives just the message.
//! - [`ChannelAwareListener`] also receives the worker's channel, which is
//!   what manual acknowledgement mode needs.
//!
//! A listener steers the disposition of a delivery through its return value:
//! `Ok(())` acknowledges (in auto mode), [`ListenerError::RejectDontRequeue`]
//! rejects without requeue regardless of the container default, and
//! [`ListenerError::ImmediateAck`] acknowledges despite the failure and ends
//! the current batch. Anything else follows `default_requeue_rejected`.
//!
//! [`ListenerFn`] wraps an async closure as a listener for quick wiring.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::Channel;
use crate::error::ListenerError;
use crate::message::Message;

/// Boxed future returned by [`ListenerFn`] closures.
pub type BoxListenerFuture =
    Pin<Box<dyn Future<Output = Result<(), ListenerError>> + Send + 'static>>;

/// A message listener that only needs the delivery itself.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Processes one delivery.
    async fn on_message(&self, message: &Message) -> Result<(), ListenerError>;

    /// Queues this listener expects the container to consume from.
    ///
    /// When `Some`, container start fails if the configured queue set
    /// differs.
    fn expected_queue_names(&self) -> Option<Vec<String>> {
        None
    }
}

/// A message listener that additionally receives the worker's channel,
/// e.g. to issue manual acks.
#[async_trait]
pub trait ChannelAwareListener: Send + Sync {
    /// Processes one delivery with access to the owning channel.
    async fn on_message(
        &self,
        message: &Message,
        channel: &Arc<dyn Channel>,
    ) -> Result<(), ListenerError>;

    /// See [`MessageListener::expected_queue_names`].
    fn expected_queue_names(&self) -> Option<Vec<String>> {
        None
    }
}

/// Function-backed listener.
///
/// ```
/// use mqvisor::{ListenerFn, Message};
///
/// let listener = ListenerFn::arc(|message: Message| {
///     Box::pin(async move {
///         println!("got {} bytes from {}", message.body.len(), message.queue());
///         Ok(())
///     })
/// });
/// # let _ = listener;
/// ```
pub struct ListenerFn<F> {
    f: F,
}

impl<F> ListenerFn<F>
where
    F: Fn(Message) -> BoxListenerFuture + Send + Sync + 'static,
{
    /// Wraps a closure into a shared listener handle.
    pub fn arc(f: F) -> Arc<dyn MessageListener> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F> MessageListener for ListenerFn<F>
where
    F: Fn(Message) -> BoxListenerFuture + Send + Sync + 'static,
{
    async fn on_message(&self, message: &Message) -> Result<(), ListenerError> {
        (self.f)(message.clone()).await
    }
}

/// Resolves the requeue flag for a rejected delivery.
///
/// `RejectDontRequeue` always wins over the container default; every other
/// failure follows `default_requeue_rejected`.
pub fn should_requeue(default_requeue_rejected: bool, error: &ListenerError) -> bool {
    match error {
        ListenerError::RejectDontRequeue { .. } => false,
        _ => default_requeue_rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_overrides_default_requeue() {
        assert!(!should_requeue(true, &ListenerError::reject("poison")));
        assert!(!should_requeue(false, &ListenerError::reject("poison")));
    }

    #[test]
    fn plain_failures_follow_default() {
        assert!(should_requeue(true, &ListenerError::failed("boom")));
        assert!(!should_requeue(false, &ListenerError::failed("boom")));
    }

    #[tokio::test]
    async fn listener_fn_dispatches() {
        let listener = ListenerFn::arc(|message: Message| {
            Box::pin(async move {
                if message.body == b"bad" {
                    Err(ListenerError::failed("bad payload"))
                } else {
                    Ok(())
                }
            })
        });
        let ok = Message::new("good", Default::default());
        let bad = Message::new("bad", Default::default());
        assert!(listener.on_message(&ok).await.is_ok());
        assert!(listener.on_message(&bad).await.is_err());
    }
}
