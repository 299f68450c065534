//! # mqvisor
//!
//! **mqvisor** is a supervised message-consumer container for AMQP-style
//! brokers: it maintains an elastic pool of worker consumers, delivers each
//! received message to your listener under configurable acknowledgement and
//! transaction semantics, and recovers from broker and listener failures
//! with per-worker backoff.
//!
//! ## Features
//!
//! | Area               | Description                                                      | Key types / traits                          |
//! |--------------------|------------------------------------------------------------------|---------------------------------------------|
//! | **Container**      | Lifecycle state machine, worker pool, queue-set mutation.        | [`Container`], [`ContainerState`]           |
//! | **Configuration**  | Concurrency bounds, prefetch, ack mode, recovery, hysteresis.    | [`Config`], [`AckMode`]                     |
//! | **Listeners**      | Plain or channel-aware message handlers.                         | [`MessageListener`], [`ChannelAwareListener`], [`ListenerFn`] |
//! | **Middleware**     | Explicit invocation chain (retry, custom layers).                | [`Middleware`], [`RetryMiddleware`]         |
//! | **Broker contract**| The consumed client interface + in-memory implementation.        | [`Connection`], [`Channel`], [`Admin`], [`MemoryBroker`] |
//! | **Recovery**       | Backoff policies consulted on every restart.                     | [`BackOff`], [`FixedBackOff`], [`ExponentialBackOff`] |
//! | **Transactions**   | External per-batch transactions, explicit context.               | [`TransactionManager`], [`TxAttribute`]     |
//! | **Events**         | Lifecycle events for operators.                                  | [`Event`], [`EventKind`]                    |
//! | **Errors**         | Typed errors per failure domain.                                 | [`ContainerError`], [`ConsumerError`], [`ListenerError`] |
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mqvisor::{Config, Container, ListenerFn, MemoryBroker, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     broker.declare_queue("orders");
//!
//!     let listener = ListenerFn::arc(|message: Message| {
//!         Box::pin(async move {
//!             println!("order: {} bytes", message.body.len());
//!             Ok(())
//!         })
//!     });
//!
//!     let mut cfg = Config::new(["orders"]);
//!     cfg.concurrent_min = 1;
//!     cfg.concurrent_max = 4;
//!
//!     let container = Container::new(Arc::new(broker.clone()), listener, cfg)?;
//!     container.start().await?;
//!
//!     broker.publish("orders", "hello")?;
//!     // ... run until shutdown ...
//!     container.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees and non-goals
//!
//! - Within one worker, messages reach the listener in broker delivery
//!   order; across workers there is no ordering.
//! - Every delivered message sees exactly one terminal action: ack,
//!   reject-with-requeue, or reject-without-requeue.
//! - The container does not deduplicate messages and keeps no state across
//!   process restarts.

mod broker;
mod config;
mod core;
mod error;
mod events;
mod listener;
mod message;
mod middleware;
mod policies;
mod sync;
mod tx;

// ---- Public re-exports ----

pub use broker::{
    Admin, Channel, Connection, ConsumeOptions, ConsumerSignal, ConsumerTagStrategy, MemoryBroker,
    QueueInfo,
};
pub use config::{AckMode, Config, ShardRouter};
pub use core::{Container, ContainerBuilder, ContainerState, RedeclareHook};
pub use error::{
    BrokerError, ConsumerError, ContainerError, ListenerError, ShutdownKind, TxError,
};
pub use events::{Bus, Event, EventKind};
pub use listener::{
    should_requeue, BoxListenerFuture, ChannelAwareListener, ListenerFn, MessageListener,
};
pub use message::{Message, MessageProperties};
pub use middleware::{Middleware, Next, RetryMiddleware};
pub use policies::{BackOff, BackOffExecution, ExponentialBackOff, FixedBackOff, JitterPolicy};
pub use tx::{Transaction, TransactionManager, TxAttribute};
