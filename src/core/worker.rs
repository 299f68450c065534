//! # WorkerRunner: the per-worker driver loop.
//!
//! One runner per worker, spawned by the container. The runner declares and
//! starts its [`QueueConsumer`], then loops: receive a batch, dispatch each
//! message through the invocation chain, ack or roll back, and feed the
//! scaling counters. On failure it classifies the error and either aborts
//! (stopping the container if it wins the abort race) or hands the consumer
//! back to the container for a restart with the inherited backoff execution.
//!
//! ## Flow
//! ```text
//! run()
//!  ├─► gate: container active? queues configured?
//!  ├─► redeclare (auto_declare) + consumer.start()
//!  │     ├─ QueuesNotAvailable → fatal? abort : backoff + restart
//!  │     ├─ AuthFailure        → fatal? abort : backoff + restart
//!  │     ├─ FatalStartup       → abort
//!  │     └─ other              → backoff + restart
//!  ├─► receive loop: receive_and_execute → scaling hook → idle hook
//!  └─► finalize: release, publish ConsumerStopped, then
//!        aborted ─► CAS winner stops the container, flushes abort events
//!        else    ─► container.restart_worker(old)
//! ```
//!
//! ## Rules
//! - The start latch completes exactly once; re-completion is a no-op.
//! - Every restart consumes the same backoff execution for the slot.
//! - Listener invocations are never interrupted mid-flight; shutdown waits
//!   bounded by `shutdown_timeout`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::core::consumer::{BackoffTick, QueueConsumer};
use crate::core::container::ContainerInner;
use crate::core::scaling::{ConsecutiveTracker, ScaleHint};
use crate::error::{BrokerError, ConsumerError, ListenerError};
use crate::events::{Event, EventKind};
use crate::listener::should_requeue;

/// Result of waiting on a worker's start latch.
pub(crate) enum StartWait {
    Ready,
    Fatal(String),
    TimedOut,
}

#[derive(Clone, Debug)]
enum StartState {
    Pending,
    Ready,
    Fatal(String),
}

/// One-shot startup latch: completes with success or a fatal reason.
///
/// Completion is first-wins; later calls are no-ops, so failure paths may
/// re-complete without effect.
#[derive(Clone)]
pub(crate) struct StartLatch {
    tx: watch::Sender<StartState>,
}

impl StartLatch {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(StartState::Pending);
        Self { tx }
    }

    /// Marks startup successful. No-op once completed.
    pub(crate) fn complete(&self) {
        self.tx.send_if_modified(|state| {
            if matches!(state, StartState::Pending) {
                *state = StartState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Records a fatal startup failure. No-op once completed.
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|state| {
            if matches!(state, StartState::Pending) {
                *state = StartState::Fatal(reason);
                true
            } else {
                false
            }
        });
    }

    /// Waits for completion, bounded by `timeout`.
    pub(crate) async fn wait(&self, timeout: Duration) -> StartWait {
        let mut rx = self.tx.subscribe();
        let waited =
            tokio::time::timeout(timeout, rx.wait_for(|s| !matches!(s, StartState::Pending)))
                .await;
        match waited {
            Ok(Ok(state)) => match &*state {
                StartState::Ready => StartWait::Ready,
                StartState::Fatal(reason) => StartWait::Fatal(reason.clone()),
                StartState::Pending => StartWait::TimedOut,
            },
            _ => StartWait::TimedOut,
        }
    }
}

enum StartOutcome {
    Started,
    Restart,
    Abort,
}

/// Drives one worker from startup to termination.
pub(crate) struct WorkerRunner {
    container: Weak<ContainerInner>,
    consumer: Arc<QueueConsumer>,
    latch: StartLatch,
}

impl WorkerRunner {
    pub(crate) fn new(
        container: Weak<ContainerInner>,
        consumer: Arc<QueueConsumer>,
        latch: StartLatch,
    ) -> Self {
        Self {
            container,
            consumer,
            latch,
        }
    }

    pub(crate) async fn run(self) {
        let Some(container) = self.container.upgrade() else {
            return;
        };
        if !container.is_active() {
            return;
        }
        if self.consumer.queue_count() == 0 {
            debug!(consumer = %self.consumer.name(), "consumer stopping; no queues configured");
            container.tracker().release(self.consumer.id());
            container.publish(
                Event::now(EventKind::ConsumerStopped).with_consumer(self.consumer.name()),
            );
            self.latch.complete();
            return;
        }

        let aborted = self.drive(&container).await;
        // No-op unless a path above skipped it.
        self.latch.complete();

        let registered = container.is_registered(self.consumer.id()).await;
        if !container.is_active() || !registered || aborted {
            debug!(consumer = %self.consumer.name(), "cancelling consumer");
            self.consumer.stop().await;
            container.tracker().release(self.consumer.id());
            container.publish(
                Event::now(EventKind::ConsumerStopped).with_consumer(self.consumer.name()),
            );
            if aborted {
                container.stop_from_aborted_consumer(self.consumer.id()).await;
            }
        } else {
            info!(consumer = %self.consumer.name(), "restarting consumer");
            container.restart_worker(&self.consumer).await;
        }
    }

    /// Returns true when the worker aborted (container must stop).
    async fn drive(&self, container: &Arc<ContainerInner>) -> bool {
        let cfg = container.config();
        match self.startup(container, &cfg).await {
            StartOutcome::Started => {}
            StartOutcome::Restart => return false,
            StartOutcome::Abort => return true,
        }
        self.receive_loop(container, &cfg).await
    }

    async fn startup(&self, container: &Arc<ContainerInner>, cfg: &Arc<Config>) -> StartOutcome {
        let consumer = &self.consumer;
        let name = consumer.name();
        let started: Result<(), ConsumerError> = async {
            if cfg.auto_declare {
                container
                    .redeclarer()
                    .redeclare_if_necessary(consumer.queues())
                    .await?;
            }
            consumer.start().await
        }
        .await;

        match started {
            Ok(()) => {
                self.latch.complete();
                StartOutcome::Started
            }
            Err(ConsumerError::QueuesNotAvailable { source }) => {
                if cfg.missing_queues_fatal {
                    error!(consumer = %name, error = %source, "consumer received fatal exception on startup");
                    self.latch.fail("queue(s) not available");
                    container.publish_consumer_failed(
                        name,
                        "consumer queue(s) not available",
                        true,
                        Some(source.to_string()),
                    );
                    StartOutcome::Abort
                } else {
                    self.latch.complete();
                    container.publish_consumer_failed(
                        name,
                        "consumer queue(s) not available",
                        false,
                        Some(source.to_string()),
                    );
                    self.handle_startup_failure(container).await;
                    StartOutcome::Restart
                }
            }
            Err(ConsumerError::AuthFailure { source }) => {
                if cfg.possible_auth_failure_fatal {
                    error!(consumer = %name, error = %source, "consumer received fatal authentication failure on startup");
                    self.latch.fail("authentication failure");
                    container.publish_consumer_failed(
                        name,
                        "authentication failure during startup",
                        true,
                        Some(source.to_string()),
                    );
                    StartOutcome::Abort
                } else {
                    self.latch.complete();
                    container.publish_consumer_failed(
                        name,
                        "authentication failure during startup",
                        false,
                        Some(source.to_string()),
                    );
                    self.handle_startup_failure(container).await;
                    StartOutcome::Restart
                }
            }
            Err(ConsumerError::FatalStartup { reason }) => {
                error!(consumer = %name, %reason, "consumer received fatal exception on startup");
                self.latch.fail(&reason);
                container.publish_consumer_failed(name, &reason, true, None);
                StartOutcome::Abort
            }
            Err(ConsumerError::Interrupted) => {
                debug!(consumer = %name, "consumer interrupted during startup");
                self.latch.complete();
                container.publish_consumer_failed(
                    name,
                    "consumer interrupted, processing stopped",
                    true,
                    None,
                );
                StartOutcome::Abort
            }
            Err(e) => {
                warn!(consumer = %name, error = %e, "consumer raised exception on startup, attempting restart");
                self.latch.complete();
                container.publish_consumer_failed(
                    name,
                    "consumer raised exception on startup, attempting restart",
                    false,
                    Some(e.to_string()),
                );
                self.handle_startup_failure(container).await;
                StartOutcome::Restart
            }
        }
    }

    /// The receive loop. Returns true when the worker aborted.
    ///
    /// Runs while the worker is active in the container, or still holds
    /// undelivered items, or has not been cancelled yet.
    async fn receive_loop(&self, container: &Arc<ContainerInner>, cfg: &Arc<Config>) -> bool {
        let consumer = &self.consumer;
        let name = consumer.name();
        let mut streaks = ConsecutiveTracker::new(
            cfg.consecutive_active_trigger,
            cfg.consecutive_idle_trigger,
        );
        loop {
            let registered = container.is_registered(consumer.id()).await;
            let active = container.is_active() && registered;
            if !(active || consumer.has_delivery().await || !consumer.is_cancelled()) {
                return false;
            }
            match self.receive_and_execute(container, cfg).await {
                Ok(received) => {
                    if active && container.scaling_elastic().await {
                        match streaks.record(received) {
                            ScaleHint::ConsiderAdd => container.consider_add().await,
                            ScaleHint::ConsiderRemove => container.consider_remove(consumer).await,
                            ScaleHint::Hold => {}
                        }
                    }
                    if let Some(interval) = cfg.idle_event_interval {
                        if received {
                            container.note_receive();
                        } else {
                            container.maybe_publish_idle(interval).await;
                        }
                    }
                }
                Err(ConsumerError::Listener(e)) if e.is_invalid_listener() => {
                    error!(consumer = %name, error = %e, "consumer received fatal exception during processing");
                    container.publish_consumer_failed(
                        name,
                        "consumer received fatal exception during processing",
                        true,
                        Some(e.to_string()),
                    );
                    return true;
                }
                Err(ConsumerError::Listener(ListenerError::RejectDontRequeue { .. })) => {
                    // Already rejected without requeue; keep consuming.
                }
                Err(ConsumerError::Listener(e)) => {
                    warn!(consumer = %name, error = %e, "listener failed, attempting restart");
                    container.publish_consumer_failed(
                        name,
                        "consumer raised exception, attempting restart",
                        false,
                        Some(e.to_string()),
                    );
                    return false;
                }
                Err(ConsumerError::Interrupted) => {
                    debug!(consumer = %name, "consumer interrupted, processing stopped");
                    container.publish_consumer_failed(
                        name,
                        "consumer interrupted, processing stopped",
                        true,
                        None,
                    );
                    return true;
                }
                Err(ConsumerError::QueuesNotAvailable { source }) => {
                    let fatal = cfg.missing_queues_fatal;
                    error!(consumer = %name, fatal, error = %source, "consumer queue(s) became unavailable");
                    container.publish_consumer_failed(
                        name,
                        "consumer queue(s) not available",
                        fatal,
                        Some(source.to_string()),
                    );
                    return fatal;
                }
                Err(ConsumerError::AuthFailure { source }) => {
                    let fatal = cfg.possible_auth_failure_fatal;
                    error!(consumer = %name, fatal, error = %source, "authentication failure during processing");
                    container.publish_consumer_failed(
                        name,
                        "authentication failure during processing",
                        fatal,
                        Some(source.to_string()),
                    );
                    return fatal;
                }
                Err(ConsumerError::FatalStartup { reason })
                | Err(ConsumerError::FatalExecution { reason }) => {
                    error!(consumer = %name, %reason, "consumer received fatal exception during processing");
                    container.publish_consumer_failed(name, &reason, true, None);
                    return true;
                }
                Err(ConsumerError::Cancelled) => {
                    if consumer.is_normal_cancel() {
                        debug!(consumer = %name, "consumer cancelled, processing stopped");
                    } else {
                        warn!(consumer = %name, "consumer cancelled by the broker, attempting restart");
                    }
                    container.publish_consumer_failed(
                        name,
                        "consumer raised exception, attempting restart",
                        false,
                        None,
                    );
                    return false;
                }
                Err(ConsumerError::Broker(e)) if e.is_normal_shutdown() => {
                    debug!(consumer = %name, "consumer received normal shutdown signal, processing stopped");
                    return false;
                }
                Err(ConsumerError::Broker(e)) if e.is_exclusive_use() => {
                    log_exclusive_consumer_failure(name, &e);
                    container.publish_consumer_failed(
                        name,
                        "consumer raised exception, attempting restart",
                        false,
                        Some(e.to_string()),
                    );
                    return false;
                }
                Err(ConsumerError::Broker(e)) => {
                    warn!(consumer = %name, error = %e, "consumer raised exception, processing can restart");
                    container.publish_consumer_failed(
                        name,
                        "consumer raised exception, attempting restart",
                        false,
                        Some(e.to_string()),
                    );
                    return false;
                }
                Err(ConsumerError::Tx(e)) => {
                    warn!(consumer = %name, error = %e, "transaction failure, attempting restart");
                    container.publish_consumer_failed(
                        name,
                        "consumer raised exception, attempting restart",
                        false,
                        Some(e.to_string()),
                    );
                    return false;
                }
            }
        }
    }

    /// Batch entry point: wraps the inner batch in an external transaction
    /// when a manager is configured.
    async fn receive_and_execute(
        &self,
        container: &Arc<ContainerInner>,
        cfg: &Arc<Config>,
    ) -> Result<bool, ConsumerError> {
        let Some(tx_manager) = cfg.tx_manager.as_ref() else {
            return self.do_receive_and_execute(container, cfg, false).await;
        };
        let tx = tx_manager.begin().await?;
        match self.do_receive_and_execute(container, cfg, true).await {
            Ok(received) => {
                tx.commit().await?;
                Ok(received)
            }
            Err(ConsumerError::Listener(e)) if (cfg.tx_attribute.rollback_on)(&e) => {
                let requeue = cfg.always_requeue_on_tx_rollback
                    || should_requeue(cfg.default_requeue_rejected, &e);
                // Local tags are cleared here; the physical disposition
                // happens after the external rollback completes.
                let tags = self.consumer.take_delivery_tags();
                if let Err(tx_err) = tx.rollback().await {
                    warn!(consumer = %self.consumer.name(), error = %tx_err, "external transaction rollback failed");
                }
                self.consumer.reject_tags(&tags, requeue).await?;
                Err(ConsumerError::Listener(e))
            }
            Err(other) => {
                if let Err(tx_err) = tx.rollback().await {
                    warn!(consumer = %self.consumer.name(), error = %tx_err, "external transaction rollback failed");
                }
                Err(other)
            }
        }
    }

    /// The inner batch: up to `tx_size` receives, dispatching each message
    /// through the invocation chain. Returns whether any message was
    /// processed.
    async fn do_receive_and_execute(
        &self,
        container: &Arc<ContainerInner>,
        cfg: &Arc<Config>,
        external_tx: bool,
    ) -> Result<bool, ConsumerError> {
        let consumer = &self.consumer;
        let locally_tx = cfg.channel_transacted && cfg.tx_manager.is_none();
        for _ in 0..cfg.tx_size {
            trace!(consumer = %consumer.name(), "waiting for message from consumer");
            let Some(message) = consumer.next_message(cfg.receive_timeout).await? else {
                break;
            };
            let channel = consumer.channel_handle()?;
            match container.invoker().invoke(&channel, &message).await {
                Ok(()) => {}
                Err(e) if e.is_immediate_ack() => {
                    debug!(
                        consumer = %consumer.name(),
                        delivery_tag = message.delivery_tag(),
                        "listener requested ack for failed delivery"
                    );
                    break;
                }
                Err(e) => {
                    if external_tx {
                        if (cfg.tx_attribute.rollback_on)(&e) {
                            // The encompassing transaction handles rollback.
                            return Err(ConsumerError::Listener(e));
                        }
                        debug!(consumer = %consumer.name(), error = %e, "no rollback for listener error");
                        break;
                    }
                    consumer.rollback_on_exception_if_necessary(&e).await?;
                    return Err(ConsumerError::Listener(e));
                }
            }
        }
        consumer.commit_if_necessary(locally_tx).await
    }

    /// Consumes the next recovery delay from the worker's backoff
    /// execution. Sleeps in 200 ms increments, checking container liveness
    /// each tick; an exhausted execution stops the container instead.
    async fn handle_startup_failure(&self, container: &Arc<ContainerInner>) {
        match self.consumer.next_backoff_tick() {
            BackoffTick::Exhausted => {
                if container.is_active() {
                    warn!("stopping container - restart recovery attempts exhausted");
                    container.stop_container().await;
                }
            }
            BackoffTick::Delay(delay) => {
                debug!(consumer = %self.consumer.name(), ?delay, "recovering consumer");
                let deadline = Instant::now() + delay;
                while container.is_active() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let tick = (deadline - now).min(Duration::from_millis(200));
                    tokio::time::sleep(tick).await;
                }
            }
            BackoffTick::Detached => {}
        }
    }
}

/// Conditional logger for exclusive-consumer channel closes: expected
/// contention logs at warn, anything else reaching this path is a bug worth
/// an error.
fn log_exclusive_consumer_failure(consumer: &str, error: &BrokerError) {
    if error.is_exclusive_use() {
        warn!(consumer = %consumer, error = %error, "exclusive consumer failure");
    } else {
        error!(consumer = %consumer, error = %error, "unexpected exclusive-consumer failure log");
    }
}
