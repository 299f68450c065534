//! # QueueConsumer: one worker's broker-facing state.
//!
//! A [`QueueConsumer`] owns a single channel, one consumer tag per queue, a
//! bounded in-memory delivery queue fed by the broker client's I/O side, and
//! the set of unacked delivery tags for the current batch.
//!
//! ## Lifecycle
//! ```text
//! NEW ──start()──► DECLARING ──consume ok──► CONSUMING
//!                      │                        │
//!                      └──── basic_cancel ──────┴──► CANCELLING ──stop()──► STOPPED
//! ```
//! Only CONSUMING delivers messages. The runner drives `next_message` /
//! `commit_if_necessary` / `rollback_on_exception_if_necessary`; the
//! container calls `basic_cancel` and `stop` from outside.
//!
//! ## Rules
//! - The delivery queue capacity is at least the effective prefetch, so the
//!   broker can fill its window without back-pressuring the I/O callback.
//! - A delivery tag lives in `delivery_tags` from dequeue until ack,
//!   reject, or rollback; it never outlives the channel.
//! - Passive declaration failures retry `declaration_retries` times; if only
//!   a strict subset of queues is reachable the consumer starts on that
//!   subset and keeps retrying the missing ones every
//!   `retry_declaration_interval`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{Channel, Connection, ConsumeOptions, ConsumerSignal, ConsumerTagStrategy};
use crate::config::{AckMode, Config};
use crate::core::active::ActiveTracker;
use crate::error::{BrokerError, ConsumerError, ListenerError};
use crate::listener::should_requeue;
use crate::message::Message;
use crate::policies::BackOffExecution;
use crate::sync::lock;

/// Consumer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerState {
    New,
    Declaring,
    Consuming,
    Cancelling,
    Stopped,
}

impl ConsumerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConsumerState::New,
            1 => ConsumerState::Declaring,
            2 => ConsumerState::Consuming,
            3 => ConsumerState::Cancelling,
            _ => ConsumerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConsumerState::New => 0,
            ConsumerState::Declaring => 1,
            ConsumerState::Consuming => 2,
            ConsumerState::Cancelling => 3,
            ConsumerState::Stopped => 4,
        }
    }
}

/// What the shared backoff execution yields for the next recovery attempt.
pub(crate) enum BackoffTick {
    /// Sleep this long, then retry.
    Delay(Duration),
    /// Attempts exhausted; the container must stop.
    Exhausted,
    /// The execution moved to a replacement consumer; do nothing.
    Detached,
}

/// Consumer-facing slice of the container configuration.
#[derive(Clone)]
pub(crate) struct ConsumerOptions {
    pub queues: Vec<String>,
    pub ack_mode: AckMode,
    pub transacted: bool,
    pub prefetch: u16,
    pub default_requeue_rejected: bool,
    pub no_local: bool,
    pub exclusive: bool,
    pub declaration_retries: u32,
    pub failed_declaration_retry_interval: Duration,
    pub retry_declaration_interval: Duration,
    pub tag_strategy: Option<Arc<dyn ConsumerTagStrategy>>,
    pub consumer_args: BTreeMap<String, String>,
}

impl ConsumerOptions {
    pub(crate) fn from_config(cfg: &Config, queues: Vec<String>) -> Self {
        Self {
            queues,
            ack_mode: cfg.ack_mode,
            transacted: cfg.channel_transacted,
            prefetch: cfg.effective_prefetch(),
            default_requeue_rejected: cfg.default_requeue_rejected,
            no_local: cfg.no_local,
            exclusive: cfg.exclusive,
            declaration_retries: cfg.declaration_retries,
            failed_declaration_retry_interval: cfg.failed_declaration_retry_interval,
            retry_declaration_interval: cfg.retry_declaration_interval,
            tag_strategy: cfg.consumer_tag_strategy.clone(),
            consumer_args: cfg.consumer_args.clone(),
        }
    }
}

/// One worker's broker-facing object.
pub(crate) struct QueueConsumer {
    id: u64,
    name: String,
    opts: ConsumerOptions,
    connection: Arc<dyn Connection>,
    tracker: ActiveTracker,
    channel: StdMutex<Option<Arc<dyn Channel>>>,
    signals_tx: mpsc::Sender<ConsumerSignal>,
    signals_rx: TokioMutex<mpsc::Receiver<ConsumerSignal>>,
    /// Consumer tag → queue.
    consumer_tags: StdMutex<HashMap<String, String>>,
    /// Unacked delivery tags of the current batch, in delivery order.
    delivery_tags: StdMutex<BTreeSet<u64>>,
    /// Queues that failed passive declaration but have reachable siblings.
    missing_queues: StdMutex<Vec<String>>,
    last_declare_retry: StdMutex<Instant>,
    state: AtomicU8,
    cancelled: AtomicBool,
    normal_cancel: AtomicBool,
    interrupt: CancellationToken,
    backoff: StdMutex<Option<Box<dyn BackOffExecution>>>,
}

impl QueueConsumer {
    pub(crate) fn new(
        id: u64,
        connection: Arc<dyn Connection>,
        opts: ConsumerOptions,
        tracker: ActiveTracker,
        backoff: Box<dyn BackOffExecution>,
    ) -> Arc<Self> {
        // Room for a full prefetch window plus one cancel signal per queue.
        let capacity = opts.prefetch.max(1) as usize + opts.queues.len() + 1;
        let (signals_tx, signals_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            id,
            name: format!("consumer-{id}"),
            opts,
            connection,
            tracker,
            channel: StdMutex::new(None),
            signals_tx,
            signals_rx: TokioMutex::new(signals_rx),
            consumer_tags: StdMutex::new(HashMap::new()),
            delivery_tags: StdMutex::new(BTreeSet::new()),
            missing_queues: StdMutex::new(Vec::new()),
            last_declare_retry: StdMutex::new(Instant::now()),
            state: AtomicU8::new(ConsumerState::New.as_u8()),
            cancelled: AtomicBool::new(false),
            normal_cancel: AtomicBool::new(false),
            interrupt: CancellationToken::new(),
            backoff: StdMutex::new(Some(backoff)),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn queue_count(&self) -> usize {
        self.opts.queues.len()
    }

    pub(crate) fn queues(&self) -> &[String] {
        &self.opts.queues
    }

    pub(crate) fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn is_declaring(&self) -> bool {
        self.state() == ConsumerState::Declaring
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_normal_cancel(&self) -> bool {
        self.normal_cancel.load(Ordering::Acquire)
    }

    /// Cancels any blocking poll or declare retry (shutdown interrupt).
    pub(crate) fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Yields the next recovery delay from the shared backoff execution.
    pub(crate) fn next_backoff_tick(&self) -> BackoffTick {
        let mut guard = lock(&self.backoff);
        match guard.as_mut() {
            None => BackoffTick::Detached,
            Some(exec) => match exec.next_delay() {
                Some(delay) => BackoffTick::Delay(delay),
                None => BackoffTick::Exhausted,
            },
        }
    }

    /// Moves the backoff execution out, for a replacement consumer to
    /// inherit. Attempts keep growing across restarts of the same slot.
    pub(crate) fn take_backoff_execution(&self) -> Option<Box<dyn BackOffExecution>> {
        lock(&self.backoff).take()
    }

    pub(crate) fn channel_handle(&self) -> Result<Arc<dyn Channel>, ConsumerError> {
        lock(&self.channel)
            .clone()
            .ok_or(ConsumerError::FatalStartup {
                reason: "channel not open".into(),
            })
    }

    /// Opens the channel, declares the queues (with retries), and starts
    /// consuming. Registers with the active tracker.
    pub(crate) async fn start(&self) -> Result<(), ConsumerError> {
        self.set_state(ConsumerState::Declaring);
        self.tracker.add(self.id);

        let channel = match self.connection.open_channel().await {
            Ok(channel) => channel,
            Err(e @ BrokerError::PossibleAuthFailure { .. }) => {
                return Err(ConsumerError::AuthFailure { source: e });
            }
            Err(e) => return Err(ConsumerError::Broker(e)),
        };
        *lock(&self.channel) = Some(Arc::clone(&channel));

        if !self.opts.ack_mode.is_auto_ack() {
            channel.qos(self.opts.prefetch).await?;
        }
        if self.opts.transacted {
            channel.tx_select().await?;
        }

        let declared = self.attempt_passive_declarations(&channel).await?;
        for queue in &declared {
            self.consume_from(&channel, queue).await?;
        }
        self.set_state(ConsumerState::Consuming);
        debug!(consumer = %self.name, queues = ?declared, "started consuming");
        Ok(())
    }

    /// Passive-declares every configured queue, retrying per policy.
    ///
    /// Returns the queues that are reachable now. Queues missing while a
    /// strict subset is reachable are parked in `missing_queues` for
    /// periodic retry; if nothing is reachable after all attempts the
    /// consumer fails with `QueuesNotAvailable`.
    async fn attempt_passive_declarations(
        &self,
        channel: &Arc<dyn Channel>,
    ) -> Result<Vec<String>, ConsumerError> {
        let mut attempt = 0u32;
        loop {
            let mut missing = Vec::new();
            for queue in &self.opts.queues {
                match channel.declare_passive(queue).await {
                    Ok(_) => {}
                    Err(BrokerError::QueueNotFound { .. }) => missing.push(queue.clone()),
                    Err(e) => return Err(ConsumerError::Broker(e)),
                }
            }
            if missing.is_empty() {
                lock(&self.missing_queues).clear();
                return Ok(self.opts.queues.clone());
            }
            if missing.len() < self.opts.queues.len() {
                warn!(
                    consumer = %self.name,
                    missing = ?missing,
                    "not all queues are available; consuming from the reachable subset"
                );
                let declared = self
                    .opts
                    .queues
                    .iter()
                    .filter(|q| !missing.contains(q))
                    .cloned()
                    .collect();
                *lock(&self.missing_queues) = missing;
                *lock(&self.last_declare_retry) = Instant::now();
                return Ok(declared);
            }
            attempt += 1;
            if attempt >= self.opts.declaration_retries {
                return Err(ConsumerError::QueuesNotAvailable {
                    source: BrokerError::QueueNotFound {
                        queue: missing.join(", "),
                    },
                });
            }
            debug!(
                consumer = %self.name,
                attempt,
                "queue declaration failed; retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.opts.failed_declaration_retry_interval) => {}
                _ = self.interrupt.cancelled() => return Err(ConsumerError::Interrupted),
            }
        }
    }

    async fn consume_from(
        &self,
        channel: &Arc<dyn Channel>,
        queue: &str,
    ) -> Result<(), ConsumerError> {
        let consumer_tag = self
            .opts
            .tag_strategy
            .as_ref()
            .map(|s| s.create_consumer_tag(queue));
        let options = ConsumeOptions {
            consumer_tag,
            no_local: self.opts.no_local,
            exclusive: self.opts.exclusive,
            no_ack: self.opts.ack_mode.is_auto_ack(),
            args: self.opts.consumer_args.clone(),
        };
        let tag = channel
            .basic_consume(queue, options, self.signals_tx.clone())
            .await?;
        lock(&self.consumer_tags).insert(tag, queue.to_string());
        Ok(())
    }

    /// Retries queues that were missing at startup, once per
    /// `retry_declaration_interval`. Fails with `QueuesNotAvailable` when
    /// every configured queue has gone missing.
    async fn check_missing_queues(&self) -> Result<(), ConsumerError> {
        let due = {
            let missing = lock(&self.missing_queues);
            if missing.is_empty() {
                return Ok(());
            }
            let last = *lock(&self.last_declare_retry);
            last.elapsed() >= self.opts.retry_declaration_interval
        };
        if !due {
            return Ok(());
        }
        let channel = self.channel_handle()?;
        let snapshot: Vec<String> = lock(&self.missing_queues).clone();
        let mut still_missing = Vec::new();
        for queue in snapshot {
            match channel.declare_passive(&queue).await {
                Ok(_) => {
                    debug!(consumer = %self.name, queue = %queue, "missing queue reappeared");
                    self.consume_from(&channel, &queue).await?;
                }
                Err(BrokerError::QueueNotFound { .. }) => still_missing.push(queue),
                Err(e) => return Err(ConsumerError::Broker(e)),
            }
        }
        let all_gone = still_missing.len() == self.opts.queues.len();
        *lock(&self.missing_queues) = still_missing;
        *lock(&self.last_declare_retry) = Instant::now();
        if all_gone {
            return Err(ConsumerError::QueuesNotAvailable {
                source: BrokerError::QueueNotFound {
                    queue: self.opts.queues.join(", "),
                },
            });
        }
        Ok(())
    }

    /// Waits up to `timeout` for the next delivery.
    ///
    /// Returns `Ok(None)` on timeout, `Err(Cancelled)` once the broker
    /// cancelled this consumer's tag, `Err(Interrupted)` on shutdown
    /// interrupt.
    pub(crate) async fn next_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<Message>, ConsumerError> {
        self.check_missing_queues().await?;
        let mut rx = self.signals_rx.lock().await;
        loop {
            let received = tokio::select! {
                _ = self.interrupt.cancelled() => return Err(ConsumerError::Interrupted),
                received = tokio::time::timeout(timeout, rx.recv()) => received,
            };
            match received {
                Err(_elapsed) => {
                    if self.is_cancelled() && !self.is_normal_cancel() {
                        return Err(ConsumerError::Cancelled);
                    }
                    return Ok(None);
                }
                Ok(None) => {
                    return if self.is_normal_cancel() {
                        Ok(None)
                    } else {
                        Err(ConsumerError::Cancelled)
                    };
                }
                Ok(Some(ConsumerSignal::Delivery(message))) => {
                    lock(&self.delivery_tags).insert(message.delivery_tag());
                    return Ok(Some(message));
                }
                Ok(Some(ConsumerSignal::Cancelled { consumer_tag })) => {
                    lock(&self.consumer_tags).remove(&consumer_tag);
                    if self.is_normal_cancel() {
                        continue;
                    }
                    warn!(
                        consumer = %self.name,
                        tag = %consumer_tag,
                        "consumer cancelled by the broker"
                    );
                    self.cancelled.store(true, Ordering::Release);
                    return Err(ConsumerError::Cancelled);
                }
            }
        }
    }

    /// True while the in-memory delivery queue holds undelivered signals.
    pub(crate) async fn has_delivery(&self) -> bool {
        match self.signals_rx.try_lock() {
            Ok(rx) => !rx.is_empty(),
            // The runner is blocked inside next_message; treat as busy.
            Err(_) => true,
        }
    }

    /// Acks the pending batch (single multi-ack) and commits the local
    /// transaction if requested. Returns whether any message was processed.
    pub(crate) async fn commit_if_necessary(
        &self,
        locally_tx: bool,
    ) -> Result<bool, ConsumerError> {
        let tags: Vec<u64> = lock(&self.delivery_tags).iter().copied().collect();
        if tags.is_empty() {
            return Ok(false);
        }
        // With an external transaction manager the channel tx is still ours
        // to commit; the manager owns only the outer transaction.
        let commit_channel_tx = locally_tx || self.opts.transacted;
        let channel = self.channel_handle()?;
        let outcome = async {
            if self.opts.ack_mode.ack_required() {
                if let Some(last) = tags.last() {
                    channel.basic_ack(*last, true).await?;
                }
            }
            if commit_channel_tx {
                channel.tx_commit().await?;
            }
            Ok::<(), BrokerError>(())
        }
        .await;
        lock(&self.delivery_tags).clear();
        outcome?;
        Ok(true)
    }

    /// Applies the failure disposition for the current batch.
    ///
    /// An `ImmediateAck` acks and clears; anything else rejects every
    /// pending tag per the requeue policy, rolling back (and committing the
    /// rejects on) a locally transacted channel.
    pub(crate) async fn rollback_on_exception_if_necessary(
        &self,
        error: &ListenerError,
    ) -> Result<(), ConsumerError> {
        let tags: Vec<u64> = lock(&self.delivery_tags).iter().copied().collect();
        let channel = self.channel_handle()?;
        let outcome = async {
            if error.is_immediate_ack() {
                debug!(consumer = %self.name, "acknowledging batch at listener's request");
                if self.opts.ack_mode.ack_required() {
                    if let Some(last) = tags.last() {
                        channel.basic_ack(*last, true).await?;
                    }
                }
                if self.opts.transacted {
                    channel.tx_commit().await?;
                }
                return Ok(());
            }
            if self.opts.transacted {
                channel.tx_rollback().await?;
            }
            if self.opts.ack_mode.ack_required() {
                let requeue = should_requeue(self.opts.default_requeue_rejected, error);
                for tag in &tags {
                    channel.basic_reject(*tag, requeue).await?;
                }
                if self.opts.transacted {
                    // The rejects themselves must be committed.
                    channel.tx_commit().await?;
                }
            }
            Ok::<(), BrokerError>(())
        }
        .await;
        lock(&self.delivery_tags).clear();
        outcome?;
        Ok(())
    }

    /// Takes the pending batch tags, clearing them locally.
    pub(crate) fn take_delivery_tags(&self) -> Vec<u64> {
        let mut guard = lock(&self.delivery_tags);
        let tags = guard.iter().copied().collect();
        guard.clear();
        tags
    }

    /// Rejects the given tags with the given requeue flag. Used after an
    /// external transaction rollback.
    pub(crate) async fn reject_tags(
        &self,
        tags: &[u64],
        requeue: bool,
    ) -> Result<(), ConsumerError> {
        if tags.is_empty() {
            return Ok(());
        }
        let channel = self.channel_handle()?;
        for tag in tags {
            channel.basic_reject(*tag, requeue).await?;
        }
        if self.opts.transacted {
            channel.tx_commit().await?;
        }
        Ok(())
    }

    /// Cancels consumption. With `normal`, the runner keeps draining the
    /// in-memory queue before terminating; otherwise the cancel is treated
    /// as a failure by the next poll.
    pub(crate) async fn basic_cancel(&self, normal: bool) {
        self.normal_cancel.store(normal, Ordering::Release);
        self.cancelled.store(true, Ordering::Release);
        self.set_state(ConsumerState::Cancelling);
        let channel = lock(&self.channel).clone();
        let tags: Vec<String> = lock(&self.consumer_tags).keys().cloned().collect();
        if let Some(channel) = channel {
            for tag in tags {
                if let Err(e) = channel.basic_cancel(&tag).await {
                    debug!(consumer = %self.name, tag = %tag, error = %e, "cancel failed");
                }
            }
        }
    }

    /// Hard stop: cancel, close the channel, wake any blocked poll.
    pub(crate) async fn stop(&self) {
        if !self.is_cancelled() {
            self.basic_cancel(true).await;
        }
        let channel = lock(&self.channel).clone();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!(consumer = %self.name, error = %e, "channel close failed");
            }
        }
        self.set_state(ConsumerState::Stopped);
        self.interrupt.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::policies::{BackOff, FixedBackOff};

    fn options(queues: &[&str]) -> ConsumerOptions {
        let cfg = Config::new(queues.iter().copied());
        ConsumerOptions::from_config(&cfg, cfg.queue_names.clone())
    }

    fn consumer(broker: &MemoryBroker, opts: ConsumerOptions) -> Arc<QueueConsumer> {
        QueueConsumer::new(
            1,
            Arc::new(broker.clone()),
            opts,
            ActiveTracker::new(),
            FixedBackOff::default().start(),
        )
    }

    #[tokio::test]
    async fn start_consume_commit_acks_batch() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "hello").unwrap();
        let c = consumer(&broker, options(&["q"]));
        c.start().await.unwrap();

        let message = c
            .next_message(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("message expected");
        assert_eq!(message.body, b"hello");
        assert!(c.commit_if_necessary(false).await.unwrap());
        assert_eq!(broker.acked_count("q"), 1);
        c.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn next_message_times_out_with_nil() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let c = consumer(&broker, options(&["q"]));
        c.start().await.unwrap();
        let got = c.next_message(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
        assert!(!c.commit_if_necessary(false).await.unwrap(), "empty batch");
        c.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn all_queues_missing_fails_after_retries() {
        let broker = MemoryBroker::new();
        let mut opts = options(&["nope"]);
        opts.declaration_retries = 2;
        opts.failed_declaration_retry_interval = Duration::from_millis(10);
        let c = consumer(&broker, opts);
        let err = c.start().await.unwrap_err();
        assert!(matches!(err, ConsumerError::QueuesNotAvailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn subset_of_queues_starts_and_recovers_the_missing_one() {
        let broker = MemoryBroker::new();
        broker.declare_queue("present");
        let mut opts = options(&["present", "absent"]);
        opts.retry_declaration_interval = Duration::from_millis(50);
        let c = consumer(&broker, opts);
        c.start().await.unwrap();
        assert_eq!(broker.consumer_count("present"), 1);

        // The missing queue appears; the periodic recheck picks it up.
        broker.declare_queue("absent");
        tokio::time::sleep(Duration::from_millis(60)).await;
        broker.publish("absent", "late").unwrap();
        let message = c
            .next_message(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("delivery from the recovered queue");
        assert_eq!(message.queue(), "absent");
        c.stop().await;
    }

    #[tokio::test]
    async fn rollback_rejects_with_requeue_policy() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "m").unwrap();
        let c = consumer(&broker, options(&["q"]));
        c.start().await.unwrap();
        let _ = c.next_message(Duration::from_secs(1)).await.unwrap();

        c.rollback_on_exception_if_necessary(&ListenerError::failed("boom"))
            .await
            .unwrap();
        assert_eq!(broker.requeued_count("q"), 1);
        c.stop().await;
    }

    #[tokio::test]
    async fn rollback_honors_reject_dont_requeue() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "poison").unwrap();
        let c = consumer(&broker, options(&["q"]));
        c.start().await.unwrap();
        let _ = c.next_message(Duration::from_secs(1)).await.unwrap();

        c.rollback_on_exception_if_necessary(&ListenerError::reject("poison"))
            .await
            .unwrap();
        assert_eq!(broker.requeued_count("q"), 0);
        assert_eq!(broker.dead_letters("q").len(), 1);
        c.stop().await;
    }

    #[tokio::test]
    async fn immediate_ack_acks_instead_of_rejecting() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "m").unwrap();
        let c = consumer(&broker, options(&["q"]));
        c.start().await.unwrap();
        let _ = c.next_message(Duration::from_secs(1)).await.unwrap();

        c.rollback_on_exception_if_necessary(&ListenerError::ImmediateAck)
            .await
            .unwrap();
        assert_eq!(broker.acked_count("q"), 1);
        assert_eq!(broker.requeued_count("q"), 0);
        c.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broker_cancel_surfaces_as_cancelled() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let c = consumer(&broker, options(&["q"]));
        c.start().await.unwrap();
        broker.delete_queue("q");
        let err = c.next_message(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Cancelled));
        c.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn normal_cancel_drains_quietly() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "last").unwrap();
        let c = consumer(&broker, options(&["q"]));
        c.start().await.unwrap();
        // Wait for the delivery to land in the in-memory queue.
        let message = c.next_message(Duration::from_secs(1)).await.unwrap();
        assert!(message.is_some());
        c.basic_cancel(true).await;
        assert!(c.commit_if_necessary(false).await.unwrap());
        let after = c.next_message(Duration::from_millis(20)).await.unwrap();
        assert!(after.is_none(), "normal cancel yields nil, not an error");
        c.stop().await;
    }

    #[tokio::test]
    async fn backoff_execution_is_inheritable() {
        let broker = MemoryBroker::new();
        let c = consumer(&broker, options(&["q"]));
        assert!(matches!(c.next_backoff_tick(), BackoffTick::Delay(_)));
        let exec = c.take_backoff_execution();
        assert!(exec.is_some());
        assert!(matches!(c.next_backoff_tick(), BackoffTick::Detached));
    }

    struct QueueTags;

    impl ConsumerTagStrategy for QueueTags {
        fn create_consumer_tag(&self, queue: &str) -> String {
            format!("mq-{queue}")
        }
    }

    #[tokio::test]
    async fn tag_strategy_names_the_consumer() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.publish("q", "m").unwrap();
        let mut opts = options(&["q"]);
        opts.tag_strategy = Some(Arc::new(QueueTags));
        let c = consumer(&broker, opts);
        c.start().await.unwrap();

        assert!(
            broker.consumer_args("q", "mq-q").is_some(),
            "broker must register the strategy-generated tag"
        );
        let message = c
            .next_message(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("message expected");
        assert_eq!(message.properties.consumer_tag, "mq-q");
        c.stop().await;
    }

    #[tokio::test]
    async fn consumer_args_are_forwarded_to_the_broker() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let mut opts = options(&["q"]);
        opts.tag_strategy = Some(Arc::new(QueueTags));
        opts.consumer_args
            .insert("x-priority".into(), "10".into());
        let c = consumer(&broker, opts);
        c.start().await.unwrap();

        let args = broker
            .consumer_args("q", "mq-q")
            .expect("consumer registered under the strategy tag");
        assert_eq!(args.get("x-priority").map(String::as_str), Some("10"));
        c.stop().await;
    }
}
