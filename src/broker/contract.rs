//! # The consumed broker-client contract.
//!
//! These traits mirror the slice of an AMQP client the container needs:
//! channel management, consuming, acknowledgement primitives, local
//! transactions, and administrative (re)declaration. Deliveries are pushed
//! from the client's I/O side into a bounded [`mpsc`] sink owned by the
//! worker; the worker drains it at its own pace, bounded by the channel
//! prefetch window.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::message::Message;

/// What the broker pushes into a consumer's delivery sink.
#[derive(Debug)]
pub enum ConsumerSignal {
    /// A message delivery for one of the worker's consumer tags.
    Delivery(Message),
    /// The broker cancelled a consumer tag (queue deleted, forced cancel).
    Cancelled {
        /// The cancelled tag.
        consumer_tag: String,
    },
}

/// Options for a `basic_consume` call.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Client-chosen consumer tag; `None` lets the broker generate one.
    pub consumer_tag: Option<String>,
    /// Do not deliver messages published on this same connection.
    pub no_local: bool,
    /// Request exclusive access to the queue.
    pub exclusive: bool,
    /// Broker auto-ack: deliveries are considered acknowledged on send.
    pub no_ack: bool,
    /// Additional consumer arguments.
    pub args: BTreeMap<String, String>,
}

/// Passive-declare result for an existing queue.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,
    /// Messages ready for delivery.
    pub message_count: u64,
    /// Consumers currently attached.
    pub consumer_count: u32,
}

/// A shared broker connection; each worker opens its own channel from it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new channel. Each worker owns exactly one.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;
}

/// One broker channel, exclusively owned by a single worker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Limits how many unacknowledged deliveries the broker may push.
    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError>;

    /// Passively declares a queue, failing if it does not exist.
    async fn declare_passive(&self, queue: &str) -> Result<QueueInfo, BrokerError>;

    /// Starts consuming from `queue`, pushing deliveries and broker-side
    /// cancellations into `sink`. Returns the consumer tag.
    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        sink: mpsc::Sender<ConsumerSignal>,
    ) -> Result<String, BrokerError>;

    /// Acknowledges a delivery; with `multiple`, everything up to and
    /// including `delivery_tag`.
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError>;

    /// Rejects a single delivery, optionally returning it to the head of its
    /// queue.
    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Rejects one or more deliveries.
    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError>;

    /// Puts the channel into local-transaction mode.
    async fn tx_select(&self) -> Result<(), BrokerError>;

    /// Commits acks/rejects issued since the last commit or rollback.
    async fn tx_commit(&self) -> Result<(), BrokerError>;

    /// Discards acks/rejects issued since the last commit or rollback.
    async fn tx_rollback(&self) -> Result<(), BrokerError>;

    /// Stops a consumer by tag. Pending deliveries already pushed to the
    /// sink are unaffected.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Closes the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<(), BrokerError>;

    /// True while the channel is usable.
    fn is_open(&self) -> bool;
}

/// Administrative interface used for queue redeclaration.
#[async_trait]
pub trait Admin: Send + Sync {
    /// (Re)declares every known exchange, queue and binding. Declarations
    /// are idempotent.
    async fn initialize(&self) -> Result<(), BrokerError>;

    /// Returns properties of a queue, or `None` if it does not exist.
    async fn queue_properties(&self, queue: &str) -> Result<Option<QueueInfo>, BrokerError>;
}

/// Strategy for generating deterministic consumer tags.
///
/// By default the broker generates tags; installing a strategy makes tags
/// stable across restarts, which helps log correlation.
pub trait ConsumerTagStrategy: Send + Sync {
    /// Produces the tag to use when consuming from `queue`.
    fn create_consumer_tag(&self, queue: &str) -> String;
}
