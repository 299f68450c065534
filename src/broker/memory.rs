//! # In-process broker implementing the client contract.
//!
//! [`MemoryBroker`] is a complete, single-process implementation of
//! [`Connection`] / [`Channel`] / [`Admin`]: named queues, per-channel
//! prefetch accounting, requeue-to-head on reject, channel-local
//! transactions, exclusive-consumer refusal, and broker-initiated consumer
//! cancellation on queue deletion. It backs the scenario tests and the
//! demos; it is not a network broker.
//!
//! ## Rules
//! - Deliveries are pushed while the channel has fewer unacked messages than
//!   its prefetch; acks reopen the window.
//! - A rejected message with `requeue` returns to the **head** of its queue
//!   with the redelivered flag set.
//! - Closing a channel returns its unacked messages to their queue heads.
//! - On a transacted channel, acks and rejects take effect at `tx_commit`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::contract::{
    Admin, Channel, Connection, ConsumeOptions, ConsumerSignal, QueueInfo,
};
use crate::error::{BrokerError, ShutdownKind};
use crate::message::{Message, MessageProperties};
use crate::sync::lock;

/// A message at rest in a queue.
#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    message_id: Option<String>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

impl Stored {
    fn to_message(&self, delivery_tag: u64, consumer_tag: &str, queue: &str) -> Message {
        Message::new(
            self.body.clone(),
            MessageProperties {
                message_id: self.message_id.clone(),
                headers: self.headers.clone(),
                redelivered: self.redelivered,
                delivery_tag,
                consumer_tag: consumer_tag.to_string(),
                queue: queue.to_string(),
                ..MessageProperties::default()
            },
        )
    }
}

/// One registered consumer on a queue.
struct ConsumerEntry {
    tag: String,
    queue: String,
    exclusive: bool,
    no_ack: bool,
    args: BTreeMap<String, String>,
    channel: Arc<ChannelCore>,
    sink: mpsc::Sender<ConsumerSignal>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerEntry>,
    rr: usize,
    mismatched_args: bool,
    acked: u64,
    requeued: u64,
    dead_letters: Vec<Message>,
}

struct BrokerCore {
    queues: Mutex<HashMap<String, QueueState>>,
    next_channel_id: AtomicU64,
    next_consumer_tag: AtomicU64,
    auth_failure: AtomicBool,
    refuse_connections: AtomicBool,
}

/// Buffered acknowledgement operation on a transacted channel.
enum TxOp {
    Ack { tag: u64, multiple: bool },
    Reject { tag: u64, multiple: bool, requeue: bool },
}

struct ChannelCore {
    id: u64,
    broker: Weak<BrokerCore>,
    open: AtomicBool,
    prefetch: AtomicU16,
    transacted: AtomicBool,
    next_delivery_tag: AtomicU64,
    unacked: Mutex<BTreeMap<u64, (String, Stored)>>,
    pending: Mutex<Vec<TxOp>>,
}

impl ChannelCore {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed {
                kind: ShutdownKind::Abnormal,
                reason: "channel is closed".into(),
            })
        }
    }

    /// True when the prefetch window still has room for one more delivery.
    fn has_capacity(&self, no_ack: bool) -> bool {
        if no_ack {
            return true;
        }
        let prefetch = self.prefetch.load(Ordering::Relaxed);
        prefetch == 0 || lock(&self.unacked).len() < prefetch as usize
    }
}

/// In-process broker. Cloning shares the same queue space.
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self {
            core: Arc::new(BrokerCore {
                queues: Mutex::new(HashMap::new()),
                next_channel_id: AtomicU64::new(0),
                next_consumer_tag: AtomicU64::new(0),
                auth_failure: AtomicBool::new(false),
                refuse_connections: AtomicBool::new(false),
            }),
        }
    }

    /// Declares a queue (idempotent).
    pub fn declare_queue(&self, name: &str) {
        let mut queues = lock(&self.core.queues);
        queues.entry(name.to_string()).or_default();
    }

    /// Deletes a queue, cancelling its consumers broker-side.
    ///
    /// Returns false if the queue did not exist.
    pub fn delete_queue(&self, name: &str) -> bool {
        let removed = lock(&self.core.queues).remove(name);
        match removed {
            Some(state) => {
                for entry in state.consumers {
                    let _ = entry.sink.try_send(ConsumerSignal::Cancelled {
                        consumer_tag: entry.tag,
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Publishes a message to a queue.
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<(), BrokerError> {
        self.publish_stored(
            queue,
            Stored {
                body: body.into(),
                message_id: None,
                headers: BTreeMap::new(),
                redelivered: false,
            },
        )
    }

    /// Publishes a message carrying a publisher-assigned message id.
    pub fn publish_with_id(
        &self,
        queue: &str,
        message_id: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        self.publish_stored(
            queue,
            Stored {
                body: body.into(),
                message_id: Some(message_id.to_string()),
                headers: BTreeMap::new(),
                redelivered: false,
            },
        )
    }

    fn publish_stored(&self, queue: &str, stored: Stored) -> Result<(), BrokerError> {
        let mut queues = lock(&self.core.queues);
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue: queue.to_string(),
            })?;
        state.ready.push_back(stored);
        Self::dispatch(state);
        Ok(())
    }

    /// Simulate authentication failures on subsequent channel opens.
    pub fn set_auth_failure(&self, failing: bool) {
        self.core.auth_failure.store(failing, Ordering::Release);
    }

    /// Simulate an unreachable broker.
    pub fn set_refuse_connections(&self, refusing: bool) {
        self.core
            .refuse_connections
            .store(refusing, Ordering::Release);
    }

    /// Marks a queue as declared with conflicting arguments; the admin's
    /// `initialize` will fail for it.
    pub fn set_mismatched_args(&self, queue: &str, mismatched: bool) {
        if let Some(state) = lock(&self.core.queues).get_mut(queue) {
            state.mismatched_args = mismatched;
        }
    }

    /// Messages ready (not yet delivered or requeued back) in a queue.
    pub fn message_count(&self, queue: &str) -> usize {
        lock(&self.core.queues)
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Total acknowledged deliveries for a queue.
    pub fn acked_count(&self, queue: &str) -> u64 {
        lock(&self.core.queues).get(queue).map_or(0, |q| q.acked)
    }

    /// Total explicit reject-with-requeue operations for a queue.
    pub fn requeued_count(&self, queue: &str) -> u64 {
        lock(&self.core.queues).get(queue).map_or(0, |q| q.requeued)
    }

    /// Messages rejected without requeue (the dead-letter side channel).
    pub fn dead_letters(&self, queue: &str) -> Vec<Message> {
        lock(&self.core.queues)
            .get(queue)
            .map_or_else(Vec::new, |q| q.dead_letters.clone())
    }

    /// Consumers currently attached to a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.core.queues)
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Arguments the consumer with `consumer_tag` registered on `queue`, or
    /// `None` if no such consumer exists.
    pub fn consumer_args(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Option<BTreeMap<String, String>> {
        lock(&self.core.queues)
            .get(queue)?
            .consumers
            .iter()
            .find(|c| c.tag == consumer_tag)
            .map(|c| c.args.clone())
    }

    /// True when the queue exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.core.queues).contains_key(queue)
    }

    /// Returns an [`Admin`] managing the given queue declarations.
    pub fn admin(&self, declarations: Vec<String>) -> Arc<dyn Admin> {
        Arc::new(MemoryAdmin {
            broker: self.clone(),
            declarations,
        })
    }

    /// Pushes ready messages to consumers with open prefetch windows.
    fn dispatch(state: &mut QueueState) {
        loop {
            if state.ready.is_empty() {
                return;
            }
            state
                .consumers
                .retain(|c| c.channel.open.load(Ordering::Acquire) && !c.sink.is_closed());
            let n = state.consumers.len();
            if n == 0 {
                return;
            }
            let mut delivered = false;
            for offset in 0..n {
                let idx = (state.rr + offset) % n;
                let entry = &state.consumers[idx];
                if !entry.channel.has_capacity(entry.no_ack) {
                    continue;
                }
                let Some(stored) = state.ready.pop_front() else {
                    return;
                };
                let tag = entry.channel.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
                let message = stored.to_message(tag, &entry.tag, &entry.queue);
                if !entry.no_ack {
                    lock(&entry.channel.unacked).insert(tag, (entry.queue.clone(), stored.clone()));
                }
                match entry.sink.try_send(ConsumerSignal::Delivery(message)) {
                    Ok(()) => {
                        if entry.no_ack {
                            state.acked += 1;
                        }
                        state.rr = (idx + 1) % n;
                        delivered = true;
                        break;
                    }
                    Err(_) => {
                        // Sink full or gone; undo and try the next consumer.
                        if !entry.no_ack {
                            lock(&entry.channel.unacked).remove(&tag);
                        }
                        state.ready.push_front(stored);
                    }
                }
            }
            if !delivered {
                return;
            }
        }
    }

    /// Applies ack/reject operations against a channel and re-dispatches the
    /// touched queues.
    fn apply_ops(core: &Arc<BrokerCore>, channel: &ChannelCore, ops: Vec<TxOp>) {
        let mut acked: Vec<String> = Vec::new();
        let mut rejected: Vec<(String, Stored, bool)> = Vec::new();
        {
            let mut unacked = lock(&channel.unacked);
            for op in ops {
                match op {
                    TxOp::Ack { tag, multiple } => {
                        for key in Self::tags_for(&unacked, tag, multiple) {
                            if let Some((queue, _)) = unacked.remove(&key) {
                                acked.push(queue);
                            }
                        }
                    }
                    TxOp::Reject {
                        tag,
                        multiple,
                        requeue,
                    } => {
                        for key in Self::tags_for(&unacked, tag, multiple) {
                            if let Some((queue, stored)) = unacked.remove(&key) {
                                rejected.push((queue, stored, requeue));
                            }
                        }
                    }
                }
            }
        }

        let mut queues = lock(&core.queues);
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for queue in acked {
            if let Some(state) = queues.get_mut(&queue) {
                state.acked += 1;
                touched.insert(queue);
            }
        }
        // Reverse so the lowest delivery tag lands at the very head.
        for (queue, mut stored, requeue) in rejected.into_iter().rev() {
            if let Some(state) = queues.get_mut(&queue) {
                if requeue {
                    stored.redelivered = true;
                    state.ready.push_front(stored);
                    state.requeued += 1;
                } else {
                    state.dead_letters.push(stored.to_message(0, "", &queue));
                }
                touched.insert(queue);
            }
        }
        for queue in touched {
            if let Some(state) = queues.get_mut(&queue) {
                Self::dispatch(state);
            }
        }
    }

    fn tags_for(unacked: &BTreeMap<u64, (String, Stored)>, tag: u64, multiple: bool) -> Vec<u64> {
        if multiple {
            unacked.range(..=tag).map(|(k, _)| *k).collect()
        } else {
            vec![tag]
        }
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if self.core.refuse_connections.load(Ordering::Acquire) {
            return Err(BrokerError::ConnectionRefused {
                reason: "broker unavailable".into(),
            });
        }
        if self.core.auth_failure.load(Ordering::Acquire) {
            return Err(BrokerError::PossibleAuthFailure {
                reason: "ACCESS_REFUSED".into(),
            });
        }
        let id = self.core.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Arc::new(MemoryChannel {
            core: Arc::new(ChannelCore {
                id,
                broker: Arc::downgrade(&self.core),
                open: AtomicBool::new(true),
                prefetch: AtomicU16::new(0),
                transacted: AtomicBool::new(false),
                next_delivery_tag: AtomicU64::new(0),
                unacked: Mutex::new(BTreeMap::new()),
                pending: Mutex::new(Vec::new()),
            }),
        }))
    }
}

/// A channel handed out by [`MemoryBroker`].
struct MemoryChannel {
    core: Arc<ChannelCore>,
}

impl MemoryChannel {
    fn broker(&self) -> Result<Arc<BrokerCore>, BrokerError> {
        self.core.broker.upgrade().ok_or(BrokerError::ChannelClosed {
            kind: ShutdownKind::Abnormal,
            reason: "broker dropped".into(),
        })
    }

    fn submit(&self, op: TxOp) -> Result<(), BrokerError> {
        self.core.ensure_open()?;
        if self.core.transacted.load(Ordering::Acquire) {
            lock(&self.core.pending).push(op);
            return Ok(());
        }
        let broker = self.broker()?;
        MemoryBroker::apply_ops(&broker, &self.core, vec![op]);
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.core.ensure_open()?;
        self.core.prefetch.store(prefetch, Ordering::Relaxed);
        Ok(())
    }

    async fn declare_passive(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        self.core.ensure_open()?;
        let broker = self.broker()?;
        let queues = lock(&broker.queues);
        match queues.get(queue) {
            Some(state) => Ok(QueueInfo {
                name: queue.to_string(),
                message_count: state.ready.len() as u64,
                consumer_count: state.consumers.len() as u32,
            }),
            None => Err(BrokerError::QueueNotFound {
                queue: queue.to_string(),
            }),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        sink: mpsc::Sender<ConsumerSignal>,
    ) -> Result<String, BrokerError> {
        self.core.ensure_open()?;
        let broker = self.broker()?;
        let mut queues = lock(&broker.queues);
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue: queue.to_string(),
            })?;
        let held_exclusively = state.consumers.iter().any(|c| c.exclusive);
        if held_exclusively || (options.exclusive && !state.consumers.is_empty()) {
            return Err(BrokerError::ChannelClosed {
                kind: ShutdownKind::ExclusiveUse,
                reason: format!("queue '{queue}' in exclusive use"),
            });
        }
        let tag = options.consumer_tag.unwrap_or_else(|| {
            let n = broker.next_consumer_tag.fetch_add(1, Ordering::Relaxed) + 1;
            format!("amq.ctag-{n}")
        });
        state.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            queue: queue.to_string(),
            exclusive: options.exclusive,
            no_ack: options.no_ack,
            args: options.args,
            channel: Arc::clone(&self.core),
            sink,
        });
        MemoryBroker::dispatch(state);
        Ok(tag)
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), BrokerError> {
        self.submit(TxOp::Ack {
            tag: delivery_tag,
            multiple,
        })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.submit(TxOp::Reject {
            tag: delivery_tag,
            multiple: false,
            requeue,
        })
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.submit(TxOp::Reject {
            tag: delivery_tag,
            multiple,
            requeue,
        })
    }

    async fn tx_select(&self) -> Result<(), BrokerError> {
        self.core.ensure_open()?;
        self.core.transacted.store(true, Ordering::Release);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), BrokerError> {
        self.core.ensure_open()?;
        let ops = std::mem::take(&mut *lock(&self.core.pending));
        if !ops.is_empty() {
            let broker = self.broker()?;
            MemoryBroker::apply_ops(&broker, &self.core, ops);
        }
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), BrokerError> {
        self.core.ensure_open()?;
        lock(&self.core.pending).clear();
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let broker = self.broker()?;
        let mut queues = lock(&broker.queues);
        for state in queues.values_mut() {
            state
                .consumers
                .retain(|c| !(c.channel.id == self.core.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.core.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(broker) = self.core.broker.upgrade() else {
            return Ok(());
        };
        let mut queues = lock(&broker.queues);
        for state in queues.values_mut() {
            state.consumers.retain(|c| c.channel.id != self.core.id);
        }
        // Unacked deliveries return to the head of their queues.
        let entries: Vec<(String, Stored)> = lock(&self.core.unacked)
            .split_off(&0)
            .into_values()
            .collect();
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for (queue, mut stored) in entries.into_iter().rev() {
            if let Some(state) = queues.get_mut(&queue) {
                stored.redelivered = true;
                state.ready.push_front(stored);
                touched.insert(queue);
            }
        }
        for queue in touched {
            if let Some(state) = queues.get_mut(&queue) {
                MemoryBroker::dispatch(state);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.core.open.load(Ordering::Acquire)
    }
}

/// Admin bound to a fixed set of queue declarations.
struct MemoryAdmin {
    broker: MemoryBroker,
    declarations: Vec<String>,
}

#[async_trait]
impl Admin for MemoryAdmin {
    async fn initialize(&self) -> Result<(), BrokerError> {
        let mut queues = lock(&self.broker.core.queues);
        for name in &self.declarations {
            if let Some(state) = queues.get(name) {
                if state.mismatched_args {
                    return Err(BrokerError::MismatchedQueueArgs {
                        queue: name.clone(),
                    });
                }
            } else {
                queues.insert(name.clone(), QueueState::default());
            }
        }
        Ok(())
    }

    async fn queue_properties(&self, queue: &str) -> Result<Option<QueueInfo>, BrokerError> {
        let queues = lock(&self.broker.core.queues);
        Ok(queues.get(queue).map(|state| QueueInfo {
            name: queue.to_string(),
            message_count: state.ready.len() as u64,
            consumer_count: state.consumers.len() as u32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn consuming_channel(
        broker: &MemoryBroker,
        queue: &str,
        prefetch: u16,
    ) -> (Arc<dyn Channel>, mpsc::Receiver<ConsumerSignal>) {
        let channel = broker.open_channel().await.unwrap();
        channel.qos(prefetch).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        channel
            .basic_consume(queue, ConsumeOptions::default(), tx)
            .await
            .unwrap();
        (channel, rx)
    }

    fn body_of(signal: ConsumerSignal) -> (u64, Vec<u8>) {
        match signal {
            ConsumerSignal::Delivery(m) => (m.delivery_tag(), m.body),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prefetch_window_limits_deliveries() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        for i in 0..3 {
            broker.publish("q", format!("m{i}")).unwrap();
        }
        let (channel, mut rx) = consuming_channel(&broker, "q", 1).await;

        let (tag1, body1) = body_of(rx.recv().await.unwrap());
        assert_eq!(body1, b"m0");
        assert!(rx.try_recv().is_err(), "second delivery must wait for ack");

        channel.basic_ack(tag1, false).await.unwrap();
        let (_, body2) = body_of(rx.recv().await.unwrap());
        assert_eq!(body2, b"m1");
        assert_eq!(broker.acked_count("q"), 1);
    }

    #[tokio::test]
    async fn reject_with_requeue_returns_to_head() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "first").unwrap();
        broker.publish("q", "second").unwrap();
        let (channel, mut rx) = consuming_channel(&broker, "q", 1).await;

        let (tag, body) = body_of(rx.recv().await.unwrap());
        assert_eq!(body, b"first");
        channel.basic_reject(tag, true).await.unwrap();

        // Head of the queue again, redelivered.
        let redelivery = match rx.recv().await.unwrap() {
            ConsumerSignal::Delivery(m) => m,
            other => panic!("expected delivery, got {other:?}"),
        };
        assert_eq!(redelivery.body, b"first");
        assert!(redelivery.redelivered());
        assert_eq!(broker.requeued_count("q"), 1);
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "poison").unwrap();
        let (channel, mut rx) = consuming_channel(&broker, "q", 1).await;

        let (tag, _) = body_of(rx.recv().await.unwrap());
        channel.basic_reject(tag, false).await.unwrap();
        let dead = broker.dead_letters("q");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"poison");
        assert_eq!(broker.requeued_count("q"), 0);
    }

    #[tokio::test]
    async fn transacted_acks_apply_on_commit() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "m").unwrap();
        let (channel, mut rx) = consuming_channel(&broker, "q", 1).await;
        channel.tx_select().await.unwrap();

        let (tag, _) = body_of(rx.recv().await.unwrap());
        channel.basic_ack(tag, false).await.unwrap();
        assert_eq!(broker.acked_count("q"), 0, "ack buffered until commit");
        channel.tx_commit().await.unwrap();
        assert_eq!(broker.acked_count("q"), 1);
    }

    #[tokio::test]
    async fn transacted_rollback_discards_pending_ops() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "m").unwrap();
        let (channel, mut rx) = consuming_channel(&broker, "q", 1).await;
        channel.tx_select().await.unwrap();

        let (tag, _) = body_of(rx.recv().await.unwrap());
        channel.basic_ack(tag, false).await.unwrap();
        channel.tx_rollback().await.unwrap();
        assert_eq!(broker.acked_count("q"), 0);

        // The delivery is still unacked; rejecting and committing requeues it.
        channel.basic_reject(tag, true).await.unwrap();
        channel.tx_commit().await.unwrap();
        assert_eq!(broker.requeued_count("q"), 1);
    }

    #[tokio::test]
    async fn exclusive_consumer_refuses_others() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let channel = broker.open_channel().await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        channel
            .basic_consume(
                "q",
                ConsumeOptions {
                    exclusive: true,
                    ..ConsumeOptions::default()
                },
                tx,
            )
            .await
            .unwrap();

        let second = broker.open_channel().await.unwrap();
        let (tx2, _rx2) = mpsc::channel(4);
        let err = second
            .basic_consume("q", ConsumeOptions::default(), tx2)
            .await
            .unwrap_err();
        assert!(err.is_exclusive_use());
    }

    #[tokio::test]
    async fn close_requeues_unacked_in_order() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "a").unwrap();
        broker.publish("q", "b").unwrap();
        let (channel, mut rx) = consuming_channel(&broker, "q", 2).await;

        let _ = rx.recv().await.unwrap();
        let _ = rx.recv().await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.message_count("q"), 2);
        let (channel2, mut rx2) = consuming_channel(&broker, "q", 2).await;
        let (_, first) = body_of(rx2.recv().await.unwrap());
        assert_eq!(first, b"a", "original order preserved after close");
        channel2.close().await.unwrap();
    }

    #[tokio::test]
    async fn queue_deletion_cancels_consumers() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let (_channel, mut rx) = consuming_channel(&broker, "q", 1).await;
        assert!(broker.delete_queue("q"));
        match rx.recv().await.unwrap() {
            ConsumerSignal::Cancelled { .. } => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn admin_initialize_redeclares_and_detects_mismatch() {
        let broker = MemoryBroker::new();
        let admin = broker.admin(vec!["q1".into(), "q2".into()]);
        admin.initialize().await.unwrap();
        assert!(broker.has_queue("q1") && broker.has_queue("q2"));

        broker.set_mismatched_args("q1", true);
        let err = admin.initialize().await.unwrap_err();
        assert!(matches!(err, BrokerError::MismatchedQueueArgs { .. }));

        assert!(admin.queue_properties("q2").await.unwrap().is_some());
        assert!(admin.queue_properties("missing").await.unwrap().is_none());
    }
}
