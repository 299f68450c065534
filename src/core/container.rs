//! # Container: owns the worker set and the lifecycle state machine.
//!
//! The [`Container`] maintains a dynamically sized pool of workers against a
//! broker connection, delivers received messages to the configured listener
//! through the invocation chain, and recovers from broker and listener
//! failures with the configured backoff.
//!
//! ## Architecture
//! ```text
//! Container::start()
//!     │
//!     ├──► spawn WorkerRunner × concurrent_min
//!     │        └──► QueueConsumer (channel, tags, delivery queue)
//!     │                 └──► Invoker ──► middleware ──► listener
//!     │
//!     ├──► workers publish events ──► Bus ──► subscribers
//!     │
//!     └──► workers signal scaling ──► consider_add / consider_remove
//!
//! Container::stop()
//!     ├──► basic_cancel(normal) every worker, interrupt DECLARING ones
//!     ├──► ActiveTracker::await_drained(shutdown_timeout)
//!     └──► force-close leftover channels, deactivate tracker
//! ```
//!
//! ## Rules
//! - Worker-set mutations happen only under the worker-set lock; the
//!   lifecycle state lives in a separate watch cell so no lock is held
//!   across I/O for state reads.
//! - `|workers|` stays within `[concurrent_min, concurrent_max]` while
//!   running (transiently below during reconciliation).
//! - A fatal worker abort stops the whole container; exactly one aborting
//!   worker wins that race, and it flushes the parked failure events.
//! - Listeners must not call lifecycle operations synchronously from
//!   `on_message`; dispatch them from a separate task instead.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex as TokioMutex};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::broker::{Admin, Connection};
use crate::config::Config;
use crate::core::active::ActiveTracker;
use crate::core::consumer::{ConsumerOptions, QueueConsumer};
use crate::core::redeclare::{RedeclareHook, Redeclarer};
use crate::core::scaling::ScalingCell;
use crate::core::worker::{StartLatch, StartWait, WorkerRunner};
use crate::error::{ConsumerError, ContainerError};
use crate::events::{Bus, Event, EventKind};
use crate::listener::{ChannelAwareListener, MessageListener};
use crate::middleware::{Invoker, ListenerEndpoint, Middleware};
use crate::policies::BackOffExecution;
use crate::sync::lock;

/// Container lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ContainerState {
    /// Short stable name for logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Initialized => "initialized",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
        }
    }
}

struct WorkerHandle {
    consumer: Arc<QueueConsumer>,
}

/// Worker set plus everything guarded together with it.
struct WorkerSet {
    /// `None` while the container is stopped.
    workers: Option<HashMap<u64, WorkerHandle>>,
    cell: ScalingCell,
    queue_names: Vec<String>,
    /// Shard → worker assignment when a shard router is configured.
    shard_map: HashMap<u32, u64>,
}

/// Builder for a [`Container`].
pub struct ContainerBuilder {
    connection: Arc<dyn Connection>,
    config: Config,
    endpoint: Option<ListenerEndpoint>,
    middleware: Vec<Arc<dyn Middleware>>,
    admin: Option<Arc<dyn Admin>>,
    on_redeclare: Option<RedeclareHook>,
}

impl ContainerBuilder {
    /// Sets the message listener.
    pub fn listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.endpoint = Some(ListenerEndpoint::Plain(listener));
        self
    }

    /// Sets a channel-aware listener (for manual acknowledgement).
    pub fn channel_aware_listener(mut self, listener: Arc<dyn ChannelAwareListener>) -> Self {
        self.endpoint = Some(ListenerEndpoint::ChannelAware(listener));
        self
    }

    /// Appends a middleware layer to the invocation chain. Layers run in
    /// the order they are added, outermost first.
    pub fn layer(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Sets the admin used for queue redeclaration.
    pub fn admin(mut self, admin: Arc<dyn Admin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Hook invoked after every successful redeclaration pass.
    pub fn on_redeclare(mut self, hook: RedeclareHook) -> Self {
        self.on_redeclare = Some(hook);
        self
    }

    /// Builds the container.
    pub fn build(self) -> Result<Container, ContainerError> {
        let Some(endpoint) = self.endpoint else {
            return Err(ContainerError::config("a listener is required"));
        };
        let mut config = self.config;
        if config.tx_manager.is_some() && !config.channel_transacted {
            debug!("'channel_transacted' coerced to true because a transaction manager is configured");
            config.channel_transacted = true;
        }
        let queue_names = dedup(config.queue_names.clone());
        let bus = Bus::new(config.bus_capacity);
        let (abort_tx, abort_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ContainerState::Initialized);
        let cell = ScalingCell::new(config.concurrent_min, config.concurrent_max);
        let redeclarer = Redeclarer::new(
            self.admin,
            config.mismatched_queues_fatal,
            self.on_redeclare,
        );
        let inner = Arc::new(ContainerInner {
            config: Arc::new(config),
            connection: self.connection,
            invoker: Invoker::new(self.middleware, endpoint),
            redeclarer,
            bus,
            state,
            workers: TokioMutex::new(WorkerSet {
                workers: None,
                cell,
                queue_names: queue_names.clone(),
                shard_map: HashMap::new(),
            }),
            queues_mirror: StdMutex::new(queue_names),
            tracker: ActiveTracker::new(),
            stopping_for_abort: AtomicU64::new(0),
            abort_tx,
            abort_rx: TokioMutex::new(abort_rx),
            next_worker_id: AtomicU64::new(0),
            last_receive_ms: AtomicU64::new(0),
            last_idle_alert_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        });
        Ok(Container { inner })
    }
}

/// A message-consumer container. See the module docs for the big picture.
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").finish_non_exhaustive()
    }
}

impl Container {
    /// Starts building a container for the given connection and config.
    pub fn builder(connection: Arc<dyn Connection>, config: Config) -> ContainerBuilder {
        ContainerBuilder {
            connection,
            config,
            endpoint: None,
            middleware: Vec::new(),
            admin: None,
            on_redeclare: None,
        }
    }

    /// Convenience constructor: connection + listener + config, no
    /// middleware, no admin.
    pub fn new(
        connection: Arc<dyn Connection>,
        listener: Arc<dyn MessageListener>,
        config: Config,
    ) -> Result<Self, ContainerError> {
        Self::builder(connection, config).listener(listener).build()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContainerState {
        *self.inner.state.borrow()
    }

    /// Watch channel following lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<ContainerState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    /// Number of workers currently holding live channels.
    pub fn active_consumer_count(&self) -> usize {
        self.inner.tracker.count()
    }

    /// Number of workers in the set.
    pub async fn worker_count(&self) -> usize {
        let ws = self.inner.workers.lock().await;
        ws.workers.as_ref().map_or(0, HashMap::len)
    }

    /// The queues currently configured.
    pub fn queue_names(&self) -> Vec<String> {
        self.inner.queue_names_snapshot()
    }

    /// Consumer name currently assigned to a shard, when a shard router is
    /// configured.
    pub async fn worker_for_shard(&self, shard: u32) -> Option<String> {
        let ws = self.inner.workers.lock().await;
        let id = ws.shard_map.get(&shard)?;
        ws.workers
            .as_ref()?
            .get(id)
            .map(|h| h.consumer.name().to_string())
    }

    /// Validates the configuration and starts `concurrent_min` workers.
    ///
    /// Waits up to `consumer_start_timeout` for each worker to report
    /// startup; a fatal startup failure stops the container and is returned.
    pub async fn start(&self) -> Result<(), ContainerError> {
        let inner = &self.inner;
        let cfg = &inner.config;
        cfg.validate()?;
        if cfg.tx_manager.is_some() && inner.invoker.has_transactional_middleware() {
            return Err(ContainerError::config(
                "a transactional middleware cannot be combined with an external \
                 transaction manager; two transaction layers would be applied",
            ));
        }
        if let Some(expected) = inner.invoker.expected_queue_names() {
            let actual = inner.queue_names_snapshot();
            let expected_set: BTreeSet<&String> = expected.iter().collect();
            let actual_set: BTreeSet<&String> = actual.iter().collect();
            if expected_set != actual_set {
                return Err(ContainerError::QueueMismatch { expected, actual });
            }
        }
        inner.transition_to_starting()?;
        if let Err(e) = inner.check_mismatched_queues().await {
            inner.set_state(ContainerState::Stopped);
            return Err(e);
        }
        inner.tracker.reset();

        let latches = {
            let mut ws = inner.workers.lock().await;
            if ws.workers.is_some() {
                info!("consumers are already running");
                inner.set_state(ContainerState::Running);
                return Ok(());
            }
            ws.workers = Some(HashMap::new());
            inner.set_state(ContainerState::Running);
            let count = ws.cell.min;
            let mut latches = Vec::with_capacity(count);
            let WorkerSet {
                workers,
                queue_names,
                shard_map,
                ..
            } = &mut *ws;
            if let Some(map) = workers.as_mut() {
                for _ in 0..count {
                    let (consumer, latch) = inner.spawn_worker(map, queue_names, shard_map, None);
                    inner.publish(
                        Event::now(EventKind::ConsumerStarted).with_consumer(consumer.name()),
                    );
                    latches.push((consumer.name().to_string(), latch));
                }
            }
            latches
        };

        for (name, latch) in latches {
            match latch.wait(cfg.consumer_start_timeout).await {
                StartWait::Ready => {}
                StartWait::Fatal(reason) => {
                    error!(consumer = %name, %reason, "fatal exception on consumer startup");
                    self.stop().await;
                    return Err(ContainerError::FatalStartup { reason });
                }
                StartWait::TimedOut => {
                    error!(
                        consumer = %name,
                        timeout = ?cfg.consumer_start_timeout,
                        "consumer failed to start in time; does the runtime have enough capacity?"
                    );
                }
            }
        }
        Ok(())
    }

    /// Stops all workers, waiting up to `shutdown_timeout` for in-flight
    /// batches to finish, then force-closes leftover channels.
    ///
    /// Re-entrant stop from an aborting worker's own path is a no-op.
    pub async fn stop(&self) {
        self.inner.shutdown(None).await;
    }

    /// Updates the lower concurrency bound, reconciling the worker set.
    pub async fn set_concurrent_min(&self, min: usize) -> Result<(), ContainerError> {
        if min < 1 {
            return Err(ContainerError::config("'concurrent_min' must be at least 1"));
        }
        if self.inner.config.exclusive && min != 1 {
            return Err(ContainerError::config(
                "when the consumer is exclusive, the concurrency must be 1",
            ));
        }
        let inner = Arc::clone(&self.inner);
        let mut ws = inner.workers.lock().await;
        if min > ws.cell.max {
            return Err(ContainerError::config(
                "'concurrent_min' cannot be more than 'concurrent_max'",
            ));
        }
        let old = ws.cell.min;
        debug!(from = old, to = min, "changing minimum concurrency");
        ws.cell.min = min;
        if inner.is_active() && ws.workers.is_some() {
            let delta = old as i64 - min as i64;
            inner.adjust_workers_locked(&mut ws, delta).await?;
        }
        Ok(())
    }

    /// Updates the upper concurrency bound; shrinking cancels excess
    /// workers.
    pub async fn set_concurrent_max(&self, max: usize) -> Result<(), ContainerError> {
        if self.inner.config.exclusive && max != 1 {
            return Err(ContainerError::config(
                "when the consumer is exclusive, the concurrency must be 1",
            ));
        }
        let inner = Arc::clone(&self.inner);
        let mut ws = inner.workers.lock().await;
        if max < ws.cell.min {
            return Err(ContainerError::config(
                "'concurrent_max' cannot be less than 'concurrent_min'",
            ));
        }
        ws.cell.max = max;
        if inner.is_active() {
            let excess = ws
                .workers
                .as_ref()
                .map_or(0, |map| map.len().saturating_sub(max));
            if excess > 0 {
                inner.adjust_workers_locked(&mut ws, excess as i64).await?;
            }
        }
        Ok(())
    }

    /// Replaces the queue set; existing workers are drained and replaced.
    pub async fn set_queue_names(&self, names: Vec<String>) -> Result<(), ContainerError> {
        let names = dedup(names);
        if names.is_empty() {
            return Err(ContainerError::LastQueue);
        }
        let inner = Arc::clone(&self.inner);
        let mut ws = inner.workers.lock().await;
        ws.queue_names = names.clone();
        *lock(&inner.queues_mirror) = names;
        inner.queues_changed_locked(&mut ws).await;
        Ok(())
    }

    /// Adds queues; existing workers are drained and replaced so new
    /// consumers pick them up. The queues must exist on the broker.
    pub async fn add_queue_names(&self, names: Vec<String>) -> Result<(), ContainerError> {
        let inner = Arc::clone(&self.inner);
        let mut ws = inner.workers.lock().await;
        let mut changed = false;
        for name in dedup(names) {
            if !ws.queue_names.contains(&name) {
                ws.queue_names.push(name);
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
        *lock(&inner.queues_mirror) = ws.queue_names.clone();
        inner.queues_changed_locked(&mut ws).await;
        Ok(())
    }

    /// Removes queues. At least one queue must remain.
    pub async fn remove_queue_names(&self, names: &[String]) -> Result<(), ContainerError> {
        let inner = Arc::clone(&self.inner);
        let mut ws = inner.workers.lock().await;
        let remaining: Vec<String> = ws
            .queue_names
            .iter()
            .filter(|q| !names.contains(q))
            .cloned()
            .collect();
        if remaining.is_empty() {
            return Err(ContainerError::LastQueue);
        }
        if remaining.len() == ws.queue_names.len() {
            return Ok(());
        }
        ws.queue_names = remaining.clone();
        *lock(&inner.queues_mirror) = remaining;
        inner.queues_changed_locked(&mut ws).await;
        Ok(())
    }
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Shared container internals; workers hold a `Weak` reference to this.
pub(crate) struct ContainerInner {
    config: Arc<Config>,
    connection: Arc<dyn Connection>,
    invoker: Invoker,
    redeclarer: Redeclarer,
    bus: Bus,
    state: watch::Sender<ContainerState>,
    workers: TokioMutex<WorkerSet>,
    /// Lock-free mirror of the queue set for reads off the worker-set lock.
    queues_mirror: StdMutex<Vec<String>>,
    tracker: ActiveTracker,
    /// Worker id that won the abort race; 0 when none.
    stopping_for_abort: AtomicU64,
    abort_tx: mpsc::UnboundedSender<Event>,
    abort_rx: TokioMutex<mpsc::UnboundedReceiver<Event>>,
    next_worker_id: AtomicU64,
    last_receive_ms: AtomicU64,
    last_idle_alert_ms: AtomicU64,
    epoch: Instant,
}

impl ContainerInner {
    pub(crate) fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub(crate) fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub(crate) fn tracker(&self) -> &ActiveTracker {
        &self.tracker
    }

    pub(crate) fn redeclarer(&self) -> &Redeclarer {
        &self.redeclarer
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(
            *self.state.borrow(),
            ContainerState::Starting | ContainerState::Running
        )
    }

    fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), ContainerState::Running)
    }

    fn set_state(&self, state: ContainerState) {
        self.state.send_modify(|s| *s = state);
    }

    fn transition_to_starting(&self) -> Result<(), ContainerError> {
        let mut previous = ContainerState::Initialized;
        let moved = self.state.send_if_modified(|s| {
            previous = *s;
            if matches!(s, ContainerState::Initialized | ContainerState::Stopped) {
                *s = ContainerState::Starting;
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(ContainerError::NotStartable {
                state: previous.as_str(),
            })
        }
    }

    pub(crate) async fn is_registered(&self, id: u64) -> bool {
        let ws = self.workers.lock().await;
        ws.workers.as_ref().is_some_and(|map| map.contains_key(&id))
    }

    pub(crate) async fn scaling_elastic(&self) -> bool {
        self.workers.lock().await.cell.elastic()
    }

    pub(crate) fn queue_names_snapshot(&self) -> Vec<String> {
        lock(&self.queues_mirror).clone()
    }

    pub(crate) fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Publishes a consumer failure, or parks it when the container is
    /// running and the failure is fatal (the aborting worker flushes the
    /// parked events after stopping the container).
    pub(crate) fn publish_consumer_failed(
        &self,
        consumer: &str,
        reason: &str,
        fatal: bool,
        error: Option<String>,
    ) {
        let mut event = Event::now(EventKind::ConsumerFailed)
            .with_consumer(consumer)
            .with_reason(reason)
            .with_fatal(fatal);
        if let Some(err) = error {
            event = event.with_error(err);
        }
        if !fatal || !self.is_running() {
            self.bus.publish(event);
        } else {
            let _ = self.abort_tx.send(event);
        }
    }

    pub(crate) fn note_receive(&self) {
        self.last_receive_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Publishes a `ContainerIdle` event at most once per interval, CAS
    /// protected against concurrent idle workers.
    pub(crate) async fn maybe_publish_idle(&self, interval: Duration) {
        let now = self.elapsed_ms();
        let interval_ms = interval.as_millis() as u64;
        let last_receive = self.last_receive_ms.load(Ordering::Relaxed);
        let last_alert = self.last_idle_alert_ms.load(Ordering::Relaxed);
        if now > last_receive.saturating_add(interval_ms)
            && now > last_alert.saturating_add(interval_ms)
            && self
                .last_idle_alert_ms
                .compare_exchange(last_alert, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.publish(
                Event::now(EventKind::ContainerIdle)
                    .with_idle_for(Duration::from_millis(now.saturating_sub(last_receive)))
                    .with_queues(self.queue_names_snapshot()),
            );
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn check_mismatched_queues(&self) -> Result<(), ContainerError> {
        if !self.config.mismatched_queues_fatal || !self.redeclarer.has_admin() {
            return Ok(());
        }
        let names = self.queue_names_snapshot();
        match self.redeclarer.redeclare_if_necessary(&names).await {
            Ok(()) => Ok(()),
            Err(ConsumerError::FatalStartup { reason }) => {
                Err(ContainerError::FatalStartup { reason })
            }
            Err(e) => {
                info!(error = %e, "failed to check queue declarations during start");
                Ok(())
            }
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        map: &mut HashMap<u64, WorkerHandle>,
        queue_names: &[String],
        shard_map: &mut HashMap<u32, u64>,
        inherited: Option<Box<dyn BackOffExecution>>,
    ) -> (Arc<QueueConsumer>, StartLatch) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1;
        let backoff = inherited.unwrap_or_else(|| self.config.recovery_backoff.start());
        let consumer = QueueConsumer::new(
            id,
            Arc::clone(&self.connection),
            ConsumerOptions::from_config(&self.config, queue_names.to_vec()),
            self.tracker.clone(),
            backoff,
        );
        let latch = StartLatch::new();
        let runner = WorkerRunner::new(Arc::downgrade(self), Arc::clone(&consumer), latch.clone());
        map.insert(
            id,
            WorkerHandle {
                consumer: Arc::clone(&consumer),
            },
        );
        if let Some(router) = &self.config.shard_router {
            for shard in 0..router.shard_count() {
                shard_map.entry(shard).or_insert(id);
            }
        }
        // Workers are detached; lifecycle is tracked through the
        // ActiveTracker and the worker set, not join handles.
        let _ = tokio::spawn(runner.run());
        (consumer, latch)
    }

    /// Starts up to `delta` workers, bounded by `concurrent_max`. Waits for
    /// each start latch; a fatal startup removes the worker and is returned
    /// after the loop.
    async fn add_and_start_workers_locked(
        self: &Arc<Self>,
        ws: &mut WorkerSet,
        delta: usize,
        mut inherited: Vec<Box<dyn BackOffExecution>>,
    ) -> Result<(), ContainerError> {
        let mut first_error = None;
        for _ in 0..delta {
            let (consumer, latch) = {
                let WorkerSet {
                    workers,
                    queue_names,
                    shard_map,
                    cell,
                } = &mut *ws;
                let Some(map) = workers.as_mut() else { break };
                if map.len() >= cell.max {
                    break;
                }
                self.spawn_worker(map, queue_names, shard_map, inherited.pop())
            };
            debug!(consumer = %consumer.name(), "starting a new consumer");
            self.publish(Event::now(EventKind::ConsumerStarted).with_consumer(consumer.name()));
            match latch.wait(self.config.consumer_start_timeout).await {
                StartWait::Ready => {}
                StartWait::Fatal(reason) => {
                    error!(consumer = %consumer.name(), %reason, "error starting new consumer");
                    consumer.stop().await;
                    self.tracker.release(consumer.id());
                    if let Some(map) = ws.workers.as_mut() {
                        map.remove(&consumer.id());
                    }
                    ws.shard_map.retain(|_, v| *v != consumer.id());
                    if first_error.is_none() {
                        first_error = Some(ContainerError::FatalStartup { reason });
                    }
                }
                StartWait::TimedOut => {
                    error!(consumer = %consumer.name(), "consumer failed to start in time");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// `delta > 0` cancels that many workers; `delta < 0` adds `-delta`.
    async fn adjust_workers_locked(
        self: &Arc<Self>,
        ws: &mut WorkerSet,
        delta: i64,
    ) -> Result<(), ContainerError> {
        if delta > 0 {
            let WorkerSet {
                workers, shard_map, ..
            } = &mut *ws;
            let Some(map) = workers.as_mut() else {
                return Ok(());
            };
            let victims: Vec<u64> = map.keys().copied().take(delta as usize).collect();
            for id in victims {
                if let Some(handle) = map.remove(&id) {
                    debug!(consumer = %handle.consumer.name(), "stopping consumer to adjust concurrency");
                    handle.consumer.basic_cancel(true).await;
                    shard_map.retain(|_, v| *v != id);
                }
            }
            Ok(())
        } else if delta < 0 {
            self.add_and_start_workers_locked(ws, (-delta) as usize, Vec::new())
                .await
        } else {
            Ok(())
        }
    }

    /// On-demand scale-up, spaced by `start_consumer_min_interval`.
    pub(crate) async fn consider_add(self: &Arc<Self>) {
        let mut ws = self.workers.lock().await;
        let now = Instant::now();
        let may = {
            let Some(map) = ws.workers.as_ref() else { return };
            ws.cell
                .may_start(now, map.len(), self.config.start_consumer_min_interval)
        };
        if may {
            if let Err(e) = self
                .add_and_start_workers_locked(&mut ws, 1, Vec::new())
                .await
            {
                error!(error = %e, "error starting new consumer");
            }
            ws.cell.note_started(now);
        }
    }

    /// Idle scale-down, spaced by `stop_consumer_min_interval`.
    pub(crate) async fn consider_remove(self: &Arc<Self>, consumer: &Arc<QueueConsumer>) {
        let mut ws = self.workers.lock().await;
        let now = Instant::now();
        let may = {
            let Some(map) = ws.workers.as_ref() else { return };
            map.contains_key(&consumer.id())
                && ws
                    .cell
                    .may_stop(now, map.len(), self.config.stop_consumer_min_interval)
        };
        if may {
            consumer.basic_cancel(true).await;
            let WorkerSet {
                workers,
                shard_map,
                cell,
                ..
            } = &mut *ws;
            if let Some(map) = workers.as_mut() {
                map.remove(&consumer.id());
            }
            shard_map.retain(|_, v| *v != consumer.id());
            debug!(consumer = %consumer.name(), "idle consumer terminating");
            cell.note_stopped(now);
        }
    }

    /// Replaces a failed worker, inheriting its backoff execution so
    /// recovery delays keep growing across restarts of the same slot.
    pub(crate) async fn restart_worker(self: &Arc<Self>, old: &Arc<QueueConsumer>) {
        let mut ws = self.workers.lock().await;
        if ws.workers.is_none() {
            return;
        }
        // Recycle the channel and counter registration before replacing.
        old.stop().await;
        self.tracker.release(old.id());
        {
            let WorkerSet {
                workers, shard_map, ..
            } = &mut *ws;
            if let Some(map) = workers.as_mut() {
                map.remove(&old.id());
            }
            shard_map.retain(|_, v| *v != old.id());
        }
        if !self.is_active() {
            return;
        }
        let inherited = old.take_backoff_execution();
        let fresh = {
            let WorkerSet {
                workers,
                queue_names,
                shard_map,
                ..
            } = &mut *ws;
            let Some(map) = workers.as_mut() else { return };
            let (fresh, _latch) = self.spawn_worker(map, queue_names, shard_map, inherited);
            fresh
        };
        self.publish(
            Event::now(EventKind::ConsumerRestarted)
                .with_consumer(old.name())
                .with_replacement(fresh.name()),
        );
    }

    /// Cancels every worker in place and starts the same number of fresh
    /// ones against the current queue set. In-flight batches on the
    /// cancelled workers still commit against their old channels.
    async fn queues_changed_locked(self: &Arc<Self>, ws: &mut WorkerSet) {
        let mut inherited: Vec<Box<dyn BackOffExecution>> = Vec::new();
        let count = {
            let WorkerSet {
                workers, shard_map, ..
            } = &mut *ws;
            let Some(map) = workers.as_mut() else { return };
            let handles: Vec<WorkerHandle> = map.drain().map(|(_, h)| h).collect();
            shard_map.clear();
            let count = handles.len();
            for handle in &handles {
                debug!(consumer = %handle.consumer.name(), "queues changed; stopping consumer");
                handle.consumer.basic_cancel(true).await;
                if !self.config.reset_backoff_on_queues_changed {
                    if let Some(exec) = handle.consumer.take_backoff_execution() {
                        inherited.push(exec);
                    }
                }
            }
            count
        };
        if let Err(e) = self.add_and_start_workers_locked(ws, count, inherited).await {
            error!(error = %e, "error restarting consumers after queue change");
        }
    }

    /// Worker-facing path to a full container stop (backoff exhaustion).
    pub(crate) async fn stop_container(self: &Arc<Self>) {
        self.shutdown(None).await;
    }

    /// Called by an aborting worker after it stopped itself. The CAS winner
    /// stops the container and flushes the parked failure events, polling
    /// the queue with a 5 s bound.
    pub(crate) async fn stop_from_aborted_consumer(self: &Arc<Self>, id: u64) {
        if self
            .stopping_for_abort
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        error!("stopping container from aborted consumer");
        self.shutdown(Some(id)).await;
        self.stopping_for_abort.store(0, Ordering::Release);
        self.flush_abort_events().await;
    }

    async fn flush_abort_events(&self) {
        let mut rx = self.abort_rx.lock().await;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            self.bus.publish(event);
        }
    }

    async fn shutdown(self: &Arc<Self>, abort_owner: Option<u64>) {
        let aborting = self.stopping_for_abort.load(Ordering::Acquire);
        if aborting != 0 && abort_owner != Some(aborting) {
            info!("shutdown ignored - container is stopping due to an aborted consumer");
            return;
        }
        self.state.send_if_modified(|s| {
            if matches!(s, ContainerState::Starting | ContainerState::Running) {
                *s = ContainerState::Stopping;
                true
            } else {
                false
            }
        });

        let cancelled: Vec<Arc<QueueConsumer>> = {
            let mut ws = self.workers.lock().await;
            match ws.workers.take() {
                None => {
                    info!("shutdown ignored - container is already stopped");
                    self.set_state(ContainerState::Stopped);
                    return;
                }
                Some(map) => {
                    ws.shard_map.clear();
                    let mut consumers = Vec::with_capacity(map.len());
                    for (_, handle) in map {
                        handle.consumer.basic_cancel(true).await;
                        if handle.consumer.is_declaring() {
                            handle.consumer.interrupt();
                        }
                        consumers.push(handle.consumer);
                    }
                    consumers
                }
            }
        };

        info!("waiting for workers to finish");
        let finished = self
            .tracker
            .await_drained(self.config.shutdown_timeout)
            .await;
        if finished {
            info!("successfully waited for workers to finish");
        } else {
            info!("workers not finished");
            if self.config.force_close_channel {
                for consumer in &cancelled {
                    consumer.stop().await;
                }
            }
        }
        self.tracker.deactivate();
        self.set_state(ContainerState::Stopped);
    }
}
