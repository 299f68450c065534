//! # Container configuration.
//!
//! [`Config`] is the complete configuration surface of a container. The
//! container takes an immutable snapshot (`Arc<Config>`) at construction;
//! only the scaling bounds (`concurrent_min`/`concurrent_max`) and the queue
//! set have mutation APIs afterwards, and those live in a separate cell
//! guarded by the worker-set lock.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use mqvisor::Config;
//!
//! let mut cfg = Config::new(["orders"]);
//! cfg.concurrent_min = 2;
//! cfg.concurrent_max = 8;
//! cfg.prefetch_count = 16;
//! cfg.receive_timeout = Duration::from_millis(500);
//!
//! assert!(cfg.validate().is_ok());
//! assert_eq!(cfg.effective_prefetch(), 16);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::ConsumerTagStrategy;
use crate::error::ContainerError;
use crate::message::Message;
use crate::policies::{BackOff, FixedBackOff};
use crate::tx::{TransactionManager, TxAttribute};

/// How deliveries are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The container acks each batch after the listener returns.
    #[default]
    Auto,
    /// The listener acks through the channel itself.
    Manual,
    /// Broker-side auto-ack: deliveries are acked on send, nothing to do.
    None,
}

impl AckMode {
    /// True when the broker acks on delivery (`AckMode::None`).
    pub fn is_auto_ack(&self) -> bool {
        matches!(self, AckMode::None)
    }

    /// True when the *container* must issue acks/rejects.
    pub fn ack_required(&self) -> bool {
        matches!(self, AckMode::Auto)
    }
}

/// Routes messages to worker shards.
///
/// Sharding is optional and off by default. When a router is installed the
/// container maintains a shard → consumer assignment that mirrors worker
/// churn; the actual partitioning of traffic is expected to happen
/// broker-side (per-shard queues), the router only fixes the mapping.
pub trait ShardRouter: Send + Sync {
    /// Total number of shards.
    fn shard_count(&self) -> u32;

    /// Shard id for a message.
    fn shard_for(&self, message: &Message) -> u32;
}

/// Complete configuration for a message-consumer container.
#[derive(Clone)]
pub struct Config {
    /// Queues to consume from, in order. Never empty.
    pub queue_names: Vec<String>,
    /// Minimum (and initial) number of workers. At least 1.
    pub concurrent_min: usize,
    /// Upper bound for on-demand scaling. At least `concurrent_min`.
    pub concurrent_max: usize,
    /// Broker prefetch per channel. The effective value is raised to
    /// `tx_size` so a full batch can be in flight.
    pub prefetch_count: u16,
    /// Messages processed per batch before acks/commit.
    pub tx_size: usize,
    /// Acknowledgement mode.
    pub ack_mode: AckMode,
    /// Use channel-local transactions (tx_select/commit/rollback).
    pub channel_transacted: bool,
    /// How long a worker waits for one delivery before an idle cycle.
    pub receive_timeout: Duration,
    /// How long `stop()` waits for workers to drain before force-closing.
    pub shutdown_timeout: Duration,
    /// How long to wait for a spawned worker to report startup.
    pub consumer_start_timeout: Duration,
    /// Minimum spacing between on-demand worker starts.
    pub start_consumer_min_interval: Duration,
    /// Minimum spacing between idle worker stops.
    pub stop_consumer_min_interval: Duration,
    /// Consecutive busy receives before considering another worker.
    pub consecutive_active_trigger: u32,
    /// Consecutive idle receives before considering stopping a worker.
    pub consecutive_idle_trigger: u32,
    /// Requeue rejected messages unless the listener overrides it.
    pub default_requeue_rejected: bool,
    /// Always requeue when an external transaction rolls back.
    pub always_requeue_on_tx_rollback: bool,
    /// Consume exclusively; forces `concurrent_min == concurrent_max == 1`.
    pub exclusive: bool,
    /// Do not receive messages published on the same connection.
    pub no_local: bool,
    /// Missing queues abort the container instead of triggering recovery.
    pub missing_queues_fatal: bool,
    /// Mismatched queue arguments abort startup/restart.
    pub mismatched_queues_fatal: bool,
    /// Possible authentication failures abort instead of backing off.
    pub possible_auth_failure_fatal: bool,
    /// Redeclare missing queues through the admin before (re)starting.
    pub auto_declare: bool,
    /// Passive-declare attempts per startup before giving up.
    pub declaration_retries: u32,
    /// Spacing between failed passive-declare attempts.
    pub failed_declaration_retry_interval: Duration,
    /// Spacing between re-declare attempts for a reachable subset.
    pub retry_declaration_interval: Duration,
    /// Publish `ContainerIdle` after this long without a message.
    pub idle_event_interval: Option<Duration>,
    /// Force-close channels still busy after `shutdown_timeout`.
    pub force_close_channel: bool,
    /// Issue fresh backoff executions to replacement workers when the queue
    /// set changes. Off by default: replacements inherit the old executions
    /// so recovery delays keep growing.
    pub reset_backoff_on_queues_changed: bool,
    /// Capacity of the lifecycle event bus.
    pub bus_capacity: usize,
    /// Recovery delay policy consulted on every worker restart.
    pub recovery_backoff: Arc<dyn BackOff>,
    /// Deterministic consumer tags; `None` lets the broker generate them.
    pub consumer_tag_strategy: Option<Arc<dyn ConsumerTagStrategy>>,
    /// Extra arguments passed to `basic_consume`.
    pub consumer_args: BTreeMap<String, String>,
    /// External transaction manager wrapping each batch.
    pub tx_manager: Option<Arc<dyn TransactionManager>>,
    /// Which listener failures roll the external transaction back.
    pub tx_attribute: TxAttribute,
    /// Optional shard routing strategy. Default off.
    pub shard_router: Option<Arc<dyn ShardRouter>>,
}

impl Config {
    /// Creates a configuration for the given queues with defaults matching
    /// a low-volume container: one worker, prefetch 1, batch size 1,
    /// auto-ack by the container, 5 s fixed recovery backoff.
    pub fn new<I, S>(queue_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue_names: queue_names.into_iter().map(Into::into).collect(),
            concurrent_min: 1,
            concurrent_max: 1,
            prefetch_count: 1,
            tx_size: 1,
            ack_mode: AckMode::Auto,
            channel_transacted: false,
            receive_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            consumer_start_timeout: Duration::from_secs(60),
            start_consumer_min_interval: Duration::from_secs(10),
            stop_consumer_min_interval: Duration::from_secs(60),
            consecutive_active_trigger: 10,
            consecutive_idle_trigger: 10,
            default_requeue_rejected: true,
            always_requeue_on_tx_rollback: true,
            exclusive: false,
            no_local: false,
            missing_queues_fatal: true,
            mismatched_queues_fatal: false,
            possible_auth_failure_fatal: true,
            auto_declare: true,
            declaration_retries: 3,
            failed_declaration_retry_interval: Duration::from_secs(5),
            retry_declaration_interval: Duration::from_secs(60),
            idle_event_interval: None,
            force_close_channel: true,
            reset_backoff_on_queues_changed: false,
            bus_capacity: 1024,
            recovery_backoff: Arc::new(FixedBackOff::default()),
            consumer_tag_strategy: None,
            consumer_args: BTreeMap::new(),
            tx_manager: None,
            tx_attribute: TxAttribute::default(),
            shard_router: None,
        }
    }

    /// Prefetch actually applied to channels: there is no point prefetching
    /// less than the batch size, the worker would stall waiting for
    /// deliveries the broker withholds.
    pub fn effective_prefetch(&self) -> u16 {
        let tx = self.tx_size.min(u16::MAX as usize) as u16;
        self.prefetch_count.max(tx)
    }

    /// Validates the configuration. Called by the container on `start()`.
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.queue_names.is_empty() {
            return Err(ContainerError::config("at least one queue is required"));
        }
        if self.queue_names.iter().any(|q| q.is_empty()) {
            return Err(ContainerError::config("queue names must not be empty"));
        }
        if self.concurrent_min < 1 {
            return Err(ContainerError::config("'concurrent_min' must be at least 1"));
        }
        if self.concurrent_max < self.concurrent_min {
            return Err(ContainerError::config(
                "'concurrent_max' cannot be less than 'concurrent_min'",
            ));
        }
        if self.prefetch_count < 1 {
            return Err(ContainerError::config("'prefetch_count' must be at least 1"));
        }
        if self.tx_size < 1 {
            return Err(ContainerError::config("'tx_size' must be at least 1"));
        }
        if self.exclusive && (self.concurrent_min != 1 || self.concurrent_max != 1) {
            return Err(ContainerError::config(
                "when the consumer is exclusive, the concurrency must be 1",
            ));
        }
        if self.ack_mode.is_auto_ack() && self.tx_manager.is_some() {
            return Err(ContainerError::config(
                "acknowledge mode NONE (broker auto-ack) is not consistent with an \
                 external transaction manager",
            ));
        }
        if self.ack_mode.is_auto_ack() && self.channel_transacted {
            return Err(ContainerError::config(
                "acknowledge mode NONE (broker auto-ack) is not consistent with a \
                 transacted channel",
            ));
        }
        if self.consecutive_active_trigger < 1 || self.consecutive_idle_trigger < 1 {
            return Err(ContainerError::config(
                "consecutive active/idle triggers must be at least 1",
            ));
        }
        if self.start_consumer_min_interval.is_zero() || self.stop_consumer_min_interval.is_zero()
        {
            return Err(ContainerError::config(
                "start/stop consumer min intervals must be greater than zero",
            ));
        }
        if self.declaration_retries < 1 {
            return Err(ContainerError::config(
                "'declaration_retries' must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxError;
    use crate::tx::Transaction;
    use async_trait::async_trait;

    struct NoopTx;

    #[async_trait]
    impl TransactionManager for NoopTx {
        async fn begin(&self) -> Result<Box<dyn Transaction>, TxError> {
            Err(TxError::new("begin", "not a real manager"))
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(Config::new(["q"]).validate().is_ok());
    }

    #[test]
    fn rejects_empty_queue_set() {
        let cfg = Config::new(Vec::<String>::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_max_below_min() {
        let mut cfg = Config::new(["q"]);
        cfg.concurrent_min = 4;
        cfg.concurrent_max = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn exclusive_requires_single_worker() {
        let mut cfg = Config::new(["q"]);
        cfg.exclusive = true;
        cfg.concurrent_max = 3;
        assert!(cfg.validate().is_err());
        cfg.concurrent_max = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn broker_auto_ack_conflicts_with_external_tx() {
        let mut cfg = Config::new(["q"]);
        cfg.ack_mode = AckMode::None;
        cfg.tx_manager = Some(Arc::new(NoopTx));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn broker_auto_ack_conflicts_with_transacted_channel() {
        let mut cfg = Config::new(["q"]);
        cfg.ack_mode = AckMode::None;
        cfg.channel_transacted = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn effective_prefetch_is_raised_to_tx_size() {
        let mut cfg = Config::new(["q"]);
        cfg.prefetch_count = 2;
        cfg.tx_size = 10;
        assert_eq!(cfg.effective_prefetch(), 10);
        cfg.prefetch_count = 32;
        assert_eq!(cfg.effective_prefetch(), 32);
    }
}
