//! End-to-end scenarios driving a container against the in-memory broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use mqvisor::{
    AckMode, Channel, ChannelAwareListener, Config, Container, ContainerError, ContainerState,
    Event, EventKind, FixedBackOff, ListenerError, ListenerFn, MemoryBroker, Message,
    MessageListener, Transaction, TransactionManager, TxError,
};

/// Polls `cond` until it holds or the (tokio-clock) deadline passes.
async fn wait_until<F: FnMut() -> bool>(mut cond: F, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

/// Drains every event currently buffered in the receiver.
fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count_kind(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

fn quick_config(queue: &str) -> Config {
    let mut cfg = Config::new([queue]);
    cfg.receive_timeout = Duration::from_millis(20);
    cfg.shutdown_timeout = Duration::from_secs(5);
    cfg
}

fn recording_listener() -> (Arc<dyn MessageListener>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener = ListenerFn::arc(move |message: Message| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().unwrap().push(message.body.clone());
            Ok(())
        })
    });
    (listener, seen)
}

// S1: single queue, one worker, three messages: delivered in publish order,
// three acks, no rejects.
#[tokio::test(start_paused = true)]
async fn simple_consume_and_ack() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    for body in ["m1", "m2", "m3"] {
        broker.publish("q", body).unwrap();
    }
    let (listener, seen) = recording_listener();
    let container =
        Container::new(Arc::new(broker.clone()), listener, quick_config("q")).unwrap();

    container.start().await.unwrap();
    assert!(
        wait_until(|| broker.acked_count("q") == 3, Duration::from_secs(10)).await,
        "expected 3 acks, got {}",
        broker.acked_count("q")
    );
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()],
        "publish order preserved on a single worker"
    );
    assert_eq!(broker.requeued_count("q"), 0);
    assert!(broker.dead_letters("q").is_empty());
    container.stop().await;
    assert_eq!(container.state(), ContainerState::Stopped);
}

// S2: listener fails on the second message; with default_requeue_rejected
// the message is requeued, redelivered and acked, and the worker restarts
// exactly once.
#[tokio::test(start_paused = true)]
async fn listener_failure_requeues_and_restarts_worker() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    for body in ["m1", "m2", "m3"] {
        broker.publish("q", body).unwrap();
    }
    let listener = ListenerFn::arc(move |message: Message| {
        Box::pin(async move {
            if message.body == b"m2" && !message.redelivered() {
                Err(ListenerError::failed("transient failure"))
            } else {
                Ok(())
            }
        })
    });
    let mut cfg = quick_config("q");
    cfg.recovery_backoff = Arc::new(FixedBackOff::new(Duration::from_millis(10)));
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();
    let mut events = container.events();

    container.start().await.unwrap();
    assert!(
        wait_until(|| broker.acked_count("q") == 3, Duration::from_secs(10)).await,
        "all three messages eventually acked"
    );
    assert_eq!(broker.requeued_count("q"), 1, "m2 rejected with requeue once");
    assert!(broker.dead_letters("q").is_empty());

    container.stop().await;
    let events = drain_events(&mut events);
    assert_eq!(count_kind(&events, EventKind::ConsumerRestarted), 1);
}

// S3: RejectDontRequeue overrides default_requeue_rejected; no redelivery
// and no worker restart.
#[tokio::test(start_paused = true)]
async fn reject_dont_requeue_overrides_default() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.publish("q", "poison").unwrap();
    let listener = ListenerFn::arc(move |message: Message| {
        Box::pin(async move {
            if message.body == b"poison" {
                Err(ListenerError::reject("unprocessable"))
            } else {
                Ok(())
            }
        })
    });
    let container =
        Container::new(Arc::new(broker.clone()), listener, quick_config("q")).unwrap();
    let mut events = container.events();

    container.start().await.unwrap();
    assert!(
        wait_until(|| broker.dead_letters("q").len() == 1, Duration::from_secs(10)).await
    );
    assert_eq!(broker.requeued_count("q"), 0, "no requeue");

    // The worker keeps consuming without a restart.
    broker.publish("q", "good").unwrap();
    assert!(wait_until(|| broker.acked_count("q") == 1, Duration::from_secs(10)).await);
    container.stop().await;
    let events = drain_events(&mut events);
    assert_eq!(count_kind(&events, EventKind::ConsumerRestarted), 0);
}

// S4 + S5: sustained backlog grows the pool to concurrent_max with spaced
// starts; a drained queue shrinks it back to concurrent_min.
#[tokio::test(start_paused = true)]
async fn pool_scales_up_under_load_and_down_when_idle() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let listener = ListenerFn::arc(move |_message: Message| {
        Box::pin(async move {
            // Simulated work, so virtual time advances under load.
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        })
    });
    let mut cfg = quick_config("q");
    cfg.concurrent_min = 1;
    cfg.concurrent_max = 4;
    cfg.consecutive_active_trigger = 2;
    cfg.consecutive_idle_trigger = 2;
    cfg.start_consumer_min_interval = Duration::from_millis(50);
    cfg.stop_consumer_min_interval = Duration::from_millis(50);
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();
    let mut events = container.events();

    for i in 0..300 {
        broker.publish("q", format!("m{i}")).unwrap();
    }
    container.start().await.unwrap();

    assert!(
        wait_until(
            || container.active_consumer_count() == 4,
            Duration::from_secs(30)
        )
        .await,
        "pool should grow to concurrent_max under sustained load"
    );
    assert_eq!(container.worker_count().await, 4);
    let so_far = drain_events(&mut events);
    assert!(
        count_kind(&so_far, EventKind::ConsumerStarted) >= 4,
        "one initial start plus three scale-ups"
    );

    // Let the backlog drain, then idle cycles shrink the pool.
    assert!(wait_until(|| broker.message_count("q") == 0, Duration::from_secs(60)).await);
    assert!(
        wait_until(
            || container.active_consumer_count() == 1,
            Duration::from_secs(60)
        )
        .await,
        "pool should shrink back to concurrent_min when idle"
    );
    assert_eq!(container.worker_count().await, 1);
    container.stop().await;
}

// S6: nonexistent queue with missing_queues_fatal=false: one failure event
// per recovery attempt, spaced by the backoff interval, then the container
// stops once attempts are exhausted.
#[tokio::test(start_paused = true)]
async fn missing_queue_backs_off_then_stops_container() {
    let broker = MemoryBroker::new();
    let (listener, _) = recording_listener();
    let mut cfg = quick_config("ghost");
    cfg.missing_queues_fatal = false;
    cfg.declaration_retries = 1;
    cfg.recovery_backoff = Arc::new(FixedBackOff::with_max_attempts(
        Duration::from_millis(100),
        4,
    ));
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();
    let mut events = container.events();
    let mut state_rx = container.watch_state();

    let started_at = Instant::now();
    container.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), async {
        state_rx
            .wait_for(|s| *s == ContainerState::Stopped)
            .await
            .unwrap();
    })
    .await
    .expect("container should stop after exhausting recovery attempts");

    // Four backoff delays separate the five failed attempts.
    assert!(
        started_at.elapsed() >= Duration::from_millis(400),
        "failures must be spaced by the recovery interval"
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    let events = drain_events(&mut events);
    let failed: Vec<&Event> = events
        .iter()
        .filter(|e| e.kind == EventKind::ConsumerFailed)
        .collect();
    assert_eq!(failed.len(), 5, "one failure event per startup attempt");
    assert!(failed.iter().all(|e| e.fatal == Some(false)));
}

// Missing queue with missing_queues_fatal=true aborts the start.
#[tokio::test(start_paused = true)]
async fn missing_queue_is_fatal_when_configured() {
    let broker = MemoryBroker::new();
    let (listener, _) = recording_listener();
    let mut cfg = quick_config("ghost");
    cfg.missing_queues_fatal = true;
    cfg.declaration_retries = 1;
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();

    let err = container.start().await.unwrap_err();
    assert!(matches!(err, ContainerError::FatalStartup { .. }));
    assert!(
        wait_until(
            || container.state() == ContainerState::Stopped,
            Duration::from_secs(10)
        )
        .await
    );
}

// Channel-local transactions: a failing batch rolls back atomically and both
// messages are redelivered together.
#[tokio::test(start_paused = true)]
async fn transacted_batch_rolls_back_atomically() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.publish("q", "m1").unwrap();
    broker.publish("q", "m2").unwrap();
    let listener = ListenerFn::arc(move |message: Message| {
        Box::pin(async move {
            if message.body == b"m2" && !message.redelivered() {
                Err(ListenerError::failed("batch poison"))
            } else {
                Ok(())
            }
        })
    });
    let mut cfg = quick_config("q");
    cfg.channel_transacted = true;
    cfg.tx_size = 2;
    cfg.prefetch_count = 2;
    cfg.recovery_backoff = Arc::new(FixedBackOff::new(Duration::from_millis(10)));
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();

    container.start().await.unwrap();
    assert!(
        wait_until(|| broker.acked_count("q") == 2, Duration::from_secs(10)).await,
        "both messages acked after redelivery"
    );
    // Both tags of the failed batch were rejected together.
    assert_eq!(broker.requeued_count("q"), 2);
    container.stop().await;
}

struct RecordingTx {
    commits: Arc<AtomicU32>,
    rollbacks: Arc<AtomicU32>,
}

#[async_trait]
impl Transaction for RecordingTx {
    async fn commit(self: Box<Self>) -> Result<(), TxError> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), TxError> {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct RecordingTxManager {
    commits: Arc<AtomicU32>,
    rollbacks: Arc<AtomicU32>,
}

#[async_trait]
impl TransactionManager for RecordingTxManager {
    async fn begin(&self) -> Result<Box<dyn Transaction>, TxError> {
        Ok(Box::new(RecordingTx {
            commits: Arc::clone(&self.commits),
            rollbacks: Arc::clone(&self.rollbacks),
        }))
    }
}

// External transaction manager: a listener failure rolls the outer
// transaction back and the message is requeued
// (always_requeue_on_tx_rollback).
#[tokio::test(start_paused = true)]
async fn external_tx_rollback_requeues_message() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.publish("q", "m1").unwrap();
    let commits = Arc::new(AtomicU32::new(0));
    let rollbacks = Arc::new(AtomicU32::new(0));
    let listener = ListenerFn::arc(move |message: Message| {
        Box::pin(async move {
            if !message.redelivered() {
                Err(ListenerError::failed("first attempt fails"))
            } else {
                Ok(())
            }
        })
    });
    let mut cfg = quick_config("q");
    cfg.tx_manager = Some(Arc::new(RecordingTxManager {
        commits: Arc::clone(&commits),
        rollbacks: Arc::clone(&rollbacks),
    }));
    cfg.recovery_backoff = Arc::new(FixedBackOff::new(Duration::from_millis(10)));
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();

    container.start().await.unwrap();
    assert!(wait_until(|| broker.acked_count("q") == 1, Duration::from_secs(10)).await);
    assert_eq!(rollbacks.load(Ordering::Relaxed), 1);
    assert!(commits.load(Ordering::Relaxed) >= 1);
    assert_eq!(broker.requeued_count("q"), 1);
    container.stop().await;
}

struct ManualAckListener;

#[async_trait]
impl ChannelAwareListener for ManualAckListener {
    async fn on_message(
        &self,
        message: &Message,
        channel: &Arc<dyn Channel>,
    ) -> Result<(), ListenerError> {
        channel
            .basic_ack(message.delivery_tag(), false)
            .await
            .map_err(|e| ListenerError::failed(e.to_string()))
    }
}

// Manual acknowledgement: the listener acks through the channel and the
// container stays out of the way.
#[tokio::test(start_paused = true)]
async fn manual_ack_mode_leaves_acks_to_the_listener() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.publish("q", "m1").unwrap();
    let mut cfg = quick_config("q");
    cfg.ack_mode = AckMode::Manual;
    let container = Container::builder(Arc::new(broker.clone()), cfg)
        .channel_aware_listener(Arc::new(ManualAckListener))
        .build()
        .unwrap();

    container.start().await.unwrap();
    assert!(wait_until(|| broker.acked_count("q") == 1, Duration::from_secs(10)).await);
    container.stop().await;
}

// ImmediateAck ends the batch early but still acks the failed delivery.
#[tokio::test(start_paused = true)]
async fn immediate_ack_acks_failed_delivery() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.publish("q", "m1").unwrap();
    let listener = ListenerFn::arc(move |_message: Message| {
        Box::pin(async move { Err(ListenerError::ImmediateAck) })
    });
    let container =
        Container::new(Arc::new(broker.clone()), listener, quick_config("q")).unwrap();
    let mut events = container.events();

    container.start().await.unwrap();
    assert!(wait_until(|| broker.acked_count("q") == 1, Duration::from_secs(10)).await);
    assert_eq!(broker.requeued_count("q"), 0);
    container.stop().await;
    let events = drain_events(&mut events);
    assert_eq!(count_kind(&events, EventKind::ConsumerRestarted), 0);
}

// Invalid listener is fatal: the aborting worker stops the whole container
// and the parked failure event is flushed.
#[tokio::test(start_paused = true)]
async fn invalid_listener_stops_container() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.publish("q", "m1").unwrap();
    let listener = ListenerFn::arc(move |_message: Message| {
        Box::pin(async move {
            Err(ListenerError::InvalidListener {
                reason: "no handler for content type".into(),
            })
        })
    });
    let container =
        Container::new(Arc::new(broker.clone()), listener, quick_config("q")).unwrap();
    let mut events = container.events();
    let mut state_rx = container.watch_state();

    container.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        state_rx
            .wait_for(|s| *s == ContainerState::Stopped)
            .await
            .unwrap();
    })
    .await
    .expect("fatal listener failure must stop the container");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::ConsumerFailed && e.fatal == Some(true)));
}

// Stop waits for the in-flight listener invocation and drains the counter.
#[tokio::test(start_paused = true)]
async fn stop_waits_for_inflight_work() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.publish("q", "slow").unwrap();
    let processed = Arc::new(AtomicU32::new(0));
    let processed_in_listener = Arc::clone(&processed);
    let listener = ListenerFn::arc(move |_message: Message| {
        let processed = Arc::clone(&processed_in_listener);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            processed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    });
    let container =
        Container::new(Arc::new(broker.clone()), listener, quick_config("q")).unwrap();

    container.start().await.unwrap();
    // Give the worker a moment to pick the message up.
    tokio::time::sleep(Duration::from_millis(30)).await;
    container.stop().await;

    assert_eq!(processed.load(Ordering::Relaxed), 1, "batch finished");
    assert_eq!(broker.acked_count("q"), 1);
    assert_eq!(container.active_consumer_count(), 0);
    assert_eq!(container.state(), ContainerState::Stopped);
}

// Queue-set mutation drains and replaces workers; new consumers pick up the
// added queue.
#[tokio::test(start_paused = true)]
async fn adding_a_queue_replaces_workers() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q1");
    broker.declare_queue("q2");
    let (listener, seen) = recording_listener();
    let container =
        Container::new(Arc::new(broker.clone()), listener, quick_config("q1")).unwrap();

    container.start().await.unwrap();
    broker.publish("q1", "first").unwrap();
    assert!(wait_until(|| broker.acked_count("q1") == 1, Duration::from_secs(10)).await);

    container.add_queue_names(vec!["q2".into()]).await.unwrap();
    broker.publish("q2", "second").unwrap();
    assert!(
        wait_until(|| broker.acked_count("q2") == 1, Duration::from_secs(10)).await,
        "replacement workers must consume the added queue"
    );
    assert_eq!(seen.lock().unwrap().len(), 2);

    let err = container
        .remove_queue_names(&["q1".into(), "q2".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::LastQueue));
    container.stop().await;
}

// Concurrency setters reconcile the pool while running.
#[tokio::test(start_paused = true)]
async fn concurrency_setters_reconcile_worker_set() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let (listener, _) = recording_listener();
    let mut cfg = quick_config("q");
    cfg.concurrent_min = 2;
    cfg.concurrent_max = 4;
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();

    container.start().await.unwrap();
    assert_eq!(container.worker_count().await, 2);

    container.set_concurrent_min(3).await.unwrap();
    assert!(
        wait_until(
            || container.active_consumer_count() == 3,
            Duration::from_secs(10)
        )
        .await
    );
    assert_eq!(container.worker_count().await, 3);

    container.set_concurrent_max(3).await.unwrap();
    assert!(container.set_concurrent_min(4).await.is_err());

    container.set_concurrent_min(1).await.unwrap();
    container.set_concurrent_max(1).await.unwrap();
    assert!(
        wait_until(
            || container.active_consumer_count() == 1,
            Duration::from_secs(10)
        )
        .await,
        "shrinking the bounds cancels excess workers"
    );
    assert_eq!(container.worker_count().await, 1);
    container.stop().await;
}

// Authentication failures: fatal by default, recoverable when configured.
#[tokio::test(start_paused = true)]
async fn auth_failure_fatality_is_configurable() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.set_auth_failure(true);

    let (listener, _) = recording_listener();
    let container =
        Container::new(Arc::new(broker.clone()), listener, quick_config("q")).unwrap();
    let err = container.start().await.unwrap_err();
    assert!(matches!(err, ContainerError::FatalStartup { .. }));

    // Non-fatal: the worker backs off until credentials recover.
    let (listener, _) = recording_listener();
    let mut cfg = quick_config("q");
    cfg.possible_auth_failure_fatal = false;
    cfg.recovery_backoff = Arc::new(FixedBackOff::new(Duration::from_millis(20)));
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();
    container.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.set_auth_failure(false);
    broker.publish("q", "after recovery").unwrap();
    assert!(
        wait_until(|| broker.acked_count("q") == 1, Duration::from_secs(10)).await,
        "worker recovers once authentication succeeds"
    );
    container.stop().await;
}

// Expected-queue-names pre-start check.
struct PickyListener;

#[async_trait]
impl MessageListener for PickyListener {
    async fn on_message(&self, _message: &Message) -> Result<(), ListenerError> {
        Ok(())
    }

    fn expected_queue_names(&self) -> Option<Vec<String>> {
        Some(vec!["expected-queue".into()])
    }
}

#[tokio::test]
async fn listener_expected_queues_gate_start() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let container = Container::new(
        Arc::new(broker.clone()),
        Arc::new(PickyListener),
        quick_config("q"),
    )
    .unwrap();
    let err = container.start().await.unwrap_err();
    assert!(matches!(err, ContainerError::QueueMismatch { .. }));
}

// Mismatched queue arguments are fatal when configured so.
#[tokio::test]
async fn mismatched_queue_args_fail_start() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    broker.set_mismatched_args("q", true);
    let (listener, _) = recording_listener();
    let mut cfg = quick_config("q");
    cfg.mismatched_queues_fatal = true;
    let container = Container::builder(Arc::new(broker.clone()), cfg)
        .listener(listener)
        .admin(broker.admin(vec!["q".into()]))
        .build()
        .unwrap();

    let err = container.start().await.unwrap_err();
    assert!(matches!(err, ContainerError::FatalStartup { .. }));
    assert_eq!(container.state(), ContainerState::Stopped);
}

// Idle events fire once per interval while nothing is received.
#[tokio::test(start_paused = true)]
async fn idle_events_fire_when_quiet() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let (listener, _) = recording_listener();
    let mut cfg = quick_config("q");
    cfg.idle_event_interval = Some(Duration::from_millis(100));
    let container = Container::new(Arc::new(broker.clone()), listener, cfg).unwrap();
    let mut events = container.events();

    container.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    container.stop().await;

    let events = drain_events(&mut events);
    let idles: Vec<&Event> = events
        .iter()
        .filter(|e| e.kind == EventKind::ContainerIdle)
        .collect();
    assert!(!idles.is_empty(), "expected at least one idle event");
    let first = idles[0];
    assert!(first.idle_for.unwrap() >= Duration::from_millis(100));
    assert_eq!(first.queues.as_deref(), Some(&["q".to_string()][..]));
}

// Deleting the queue mid-consume cancels the consumer broker-side; with a
// redeclaring admin the restarted worker recovers.
#[tokio::test(start_paused = true)]
async fn broker_cancel_recovers_through_redeclaration() {
    let broker = MemoryBroker::new();
    broker.declare_queue("q");
    let (listener, _) = recording_listener();
    let mut cfg = quick_config("q");
    cfg.recovery_backoff = Arc::new(FixedBackOff::new(Duration::from_millis(10)));
    let container = Container::builder(Arc::new(broker.clone()), cfg)
        .listener(listener)
        .admin(broker.admin(vec!["q".into()]))
        .build()
        .unwrap();
    let mut events = container.events();

    container.start().await.unwrap();
    broker.delete_queue("q");

    // The replacement worker redeclares the queue and consumes again.
    assert!(
        wait_until(
            || broker.has_queue("q") && broker.consumer_count("q") == 1,
            Duration::from_secs(10)
        )
        .await,
        "queue should be redeclared and consumed after restart"
    );
    broker.publish("q", "again").unwrap();
    assert!(wait_until(|| broker.acked_count("q") == 1, Duration::from_secs(10)).await);
    container.stop().await;
    let events = drain_events(&mut events);
    assert!(count_kind(&events, EventKind::ConsumerRestarted) >= 1);
}
