//! # Invocation middleware: the chain wrapped around listener dispatch.
//!
//! Instead of proxy interception, the container composes an explicit ordered
//! list of [`Middleware`] values at start. Each middleware receives the
//! message and a [`Next`] continuation; calling `next.run(message)` hands the
//! message down the chain until it reaches the listener.
//!
//! ```text
//! worker batch loop
//!   └──► Invoker::invoke(channel, message)
//!          └──► middleware[0].handle ──► middleware[1].handle ──► listener
//! ```
//!
//! ## Rules
//! - Middlewares must pass `RejectDontRequeue` and `ImmediateAck` outcomes
//!   through unchanged; they are listener-visible contract, not failures to
//!   retry.
//! - A middleware that manages its own transaction must report
//!   `transactional() == true`; configuration validation refuses to stack it
//!   with an external transaction manager.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::broker::Channel;
use crate::error::ListenerError;
use crate::listener::{ChannelAwareListener, MessageListener};
use crate::message::Message;
use crate::sync::lock;

/// One layer of the invocation chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handles a message, usually delegating to `next.run(message)`.
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), ListenerError>;

    /// True when this middleware opens/commits its own transaction.
    fn transactional(&self) -> bool {
        false
    }

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The listener at the end of the chain.
pub(crate) enum ListenerEndpoint {
    Plain(Arc<dyn MessageListener>),
    ChannelAware(Arc<dyn ChannelAwareListener>),
}

impl ListenerEndpoint {
    async fn dispatch(
        &self,
        channel: &Arc<dyn Channel>,
        message: &Message,
    ) -> Result<(), ListenerError> {
        match self {
            ListenerEndpoint::Plain(listener) => listener.on_message(message).await,
            ListenerEndpoint::ChannelAware(listener) => listener.on_message(message, channel).await,
        }
    }

    pub(crate) fn expected_queue_names(&self) -> Option<Vec<String>> {
        match self {
            ListenerEndpoint::Plain(listener) => listener.expected_queue_names(),
            ListenerEndpoint::ChannelAware(listener) => listener.expected_queue_names(),
        }
    }
}

/// Continuation handed to each middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a ListenerEndpoint,
    channel: &'a Arc<dyn Channel>,
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain, ending at the listener.
    pub fn run(
        self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), ListenerError>> + Send + 'a>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((head, rest)) => {
                    head.handle(
                        message,
                        Next {
                            chain: rest,
                            endpoint: self.endpoint,
                            channel: self.channel,
                        },
                    )
                    .await
                }
                None => self.endpoint.dispatch(self.channel, message).await,
            }
        })
    }
}

/// The composed invocation path: middleware chain plus listener.
pub(crate) struct Invoker {
    chain: Vec<Arc<dyn Middleware>>,
    endpoint: ListenerEndpoint,
}

impl Invoker {
    pub(crate) fn new(chain: Vec<Arc<dyn Middleware>>, endpoint: ListenerEndpoint) -> Self {
        Self { chain, endpoint }
    }

    /// Invokes the chain for one delivery.
    pub(crate) async fn invoke(
        &self,
        channel: &Arc<dyn Channel>,
        message: &Message,
    ) -> Result<(), ListenerError> {
        Next {
            chain: &self.chain,
            endpoint: &self.endpoint,
            channel,
        }
        .run(message)
        .await
    }

    /// True when any middleware manages its own transaction.
    pub(crate) fn has_transactional_middleware(&self) -> bool {
        self.chain.iter().any(|m| m.transactional())
    }

    pub(crate) fn expected_queue_names(&self) -> Option<Vec<String>> {
        self.endpoint.expected_queue_names()
    }
}

/// Stateful retry keyed on the raw message id.
///
/// Failures are counted per `message_id` across redeliveries: the message is
/// requeued (by the normal rejection path) until `max_attempts` is reached,
/// after which the middleware converts the failure into
/// [`ListenerError::RejectDontRequeue`] so the broker dead-letters it.
/// Messages without an id pass through untouched.
pub struct RetryMiddleware {
    max_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryMiddleware {
    /// Creates a retry layer allowing `max_attempts` deliveries per message.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), ListenerError> {
        let Some(key) = message.properties.message_id.clone() else {
            return next.run(message).await;
        };
        match next.run(message).await {
            Ok(()) => {
                lock(&self.attempts).remove(&key);
                Ok(())
            }
            Err(e @ ListenerError::RejectDontRequeue { .. })
            | Err(e @ ListenerError::ImmediateAck)
            | Err(e @ ListenerError::InvalidListener { .. }) => Err(e),
            Err(e) => {
                let exhausted = {
                    let mut attempts = lock(&self.attempts);
                    let count = attempts.entry(key.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.max_attempts {
                        attempts.remove(&key);
                        true
                    } else {
                        false
                    }
                };
                if exhausted {
                    Err(ListenerError::reject(format!(
                        "retries exhausted after {} attempts: {e}",
                        self.max_attempts
                    )))
                } else {
                    Err(e)
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Connection, MemoryBroker};
    use crate::listener::ListenerFn;
    use crate::message::MessageProperties;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Tagging {
        header: &'static str,
    }

    #[async_trait]
    impl Middleware for Tagging {
        async fn handle(&self, message: &Message, next: Next<'_>) -> Result<(), ListenerError> {
            let mut tagged = message.clone();
            tagged
                .properties
                .headers
                .insert("seen-by".into(), self.header.into());
            next.run(&tagged).await
        }
    }

    async fn test_channel() -> Arc<dyn Channel> {
        let broker = MemoryBroker::new();
        broker.open_channel().await.unwrap()
    }

    fn message_with_id(id: &str) -> Message {
        Message::new(
            "payload",
            MessageProperties {
                message_id: Some(id.into()),
                ..MessageProperties::default()
            },
        )
    }

    #[tokio::test]
    async fn chain_runs_in_order_down_to_listener() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_in_listener = Arc::clone(&seen);
        let listener = ListenerFn::arc(move |message: Message| {
            let seen = Arc::clone(&seen_in_listener);
            Box::pin(async move {
                if let Some(v) = message.properties.headers.get("seen-by") {
                    lock(&seen).push(v.clone());
                }
                Ok(())
            })
        });
        let invoker = Invoker::new(
            vec![
                Arc::new(Tagging { header: "outer" }),
                Arc::new(Tagging { header: "inner" }),
            ],
            ListenerEndpoint::Plain(listener),
        );
        let channel = test_channel().await;
        invoker
            .invoke(&channel, &Message::new("x", Default::default()))
            .await
            .unwrap();
        // Inner middleware overwrote the header last.
        assert_eq!(lock(&seen).as_slice(), ["inner"]);
    }

    #[tokio::test]
    async fn retry_exhaustion_turns_into_reject() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_listener = Arc::clone(&calls);
        let listener = ListenerFn::arc(move |_message: Message| {
            calls_in_listener.fetch_add(1, Ordering::Relaxed);
            Box::pin(async move { Err(ListenerError::failed("always fails")) })
        });
        let invoker = Invoker::new(
            vec![Arc::new(RetryMiddleware::new(3))],
            ListenerEndpoint::Plain(listener),
        );
        let channel = test_channel().await;
        let message = message_with_id("m-1");

        for _ in 0..2 {
            let err = invoker.invoke(&channel, &message).await.unwrap_err();
            assert!(matches!(err, ListenerError::Failed { .. }));
        }
        let err = invoker.invoke(&channel, &message).await.unwrap_err();
        assert!(matches!(err, ListenerError::RejectDontRequeue { .. }));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn retry_passes_contract_errors_through() {
        let listener = ListenerFn::arc(|_message: Message| {
            Box::pin(async move { Err(ListenerError::ImmediateAck) })
        });
        let invoker = Invoker::new(
            vec![Arc::new(RetryMiddleware::new(5))],
            ListenerEndpoint::Plain(listener),
        );
        let channel = test_channel().await;
        let err = invoker
            .invoke(&channel, &message_with_id("m-2"))
            .await
            .unwrap_err();
        assert!(err.is_immediate_ack());
    }
}
