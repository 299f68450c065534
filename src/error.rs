//! # Error types used by the container runtime and its collaborators.
//!
//! This module defines one error enum per failure domain:
//!
//! - [`BrokerError`] failures surfaced by the broker client (I/O side).
//! - [`ConsumerError`] a worker's classification of what went wrong.
//! - [`ListenerError`] the listener-visible contract (reject / immediate ack).
//! - [`ContainerError`] lifecycle and configuration failures.
//! - [`TxError`] external transaction failures.
//!
//! All types provide `as_label()` for logs/metrics. [`ConsumerError`] and
//! [`BrokerError`] carry the classification helpers the worker restart
//! machinery keys on.

use std::time::Duration;

use thiserror::Error;

/// Why a channel was closed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Clean, application-initiated close.
    Normal,
    /// Unexpected close (connection loss, broker restart, protocol error).
    Abnormal,
    /// The channel was refused because a queue is held by an exclusive
    /// consumer ("in exclusive use").
    ExclusiveUse,
}

/// # Errors surfaced by the broker client.
///
/// These cross the broker contract boundary; the container never constructs
/// them itself outside of tests.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BrokerError {
    /// A passive declaration failed because the queue does not exist.
    #[error("queue '{queue}' not found on the broker")]
    QueueNotFound {
        /// The missing queue name(s).
        queue: String,
    },

    /// The channel was closed underneath an operation.
    #[error("channel closed ({kind:?}): {reason}")]
    ChannelClosed {
        /// How the channel went away.
        kind: ShutdownKind,
        /// Broker-provided close reason.
        reason: String,
    },

    /// The broker refused the connection in a way that suggests bad
    /// credentials. Possibly transient, hence "possible".
    #[error("possible authentication failure: {reason}")]
    PossibleAuthFailure { reason: String },

    /// A declaration conflicted with an existing queue's arguments
    /// (TTL, dead-letter config, ...).
    #[error("queue '{queue}' declared with mismatched arguments")]
    MismatchedQueueArgs { queue: String },

    /// The broker is unreachable.
    #[error("broker connection refused: {reason}")]
    ConnectionRefused { reason: String },

    /// Any other transport failure.
    #[error("broker i/o failure: {reason}")]
    Io { reason: String },
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::QueueNotFound { .. } => "broker_queue_not_found",
            BrokerError::ChannelClosed { .. } => "broker_channel_closed",
            BrokerError::PossibleAuthFailure { .. } => "broker_possible_auth_failure",
            BrokerError::MismatchedQueueArgs { .. } => "broker_mismatched_queue_args",
            BrokerError::ConnectionRefused { .. } => "broker_connection_refused",
            BrokerError::Io { .. } => "broker_io",
        }
    }

    /// True for a clean, application-initiated channel close.
    pub fn is_normal_shutdown(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed {
                kind: ShutdownKind::Normal,
                ..
            }
        )
    }

    /// True when the close reason is an exclusive-consumer refusal.
    pub fn is_exclusive_use(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed {
                kind: ShutdownKind::ExclusiveUse,
                ..
            }
        )
    }
}

/// # The listener-visible error contract.
///
/// Listeners signal message disposition by returning one of these. The batch
/// loop inspects the variant instead of unwinding, but the semantics match
/// the classic exception channel: `RejectDontRequeue` forces a reject without
/// requeue regardless of the container default, `ImmediateAck` forces an ack
/// and ends the batch early.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Reject the message and do not requeue it, overriding
    /// `default_requeue_rejected`. Dead-lettering relies on this.
    #[error("listener requested reject without requeue: {reason}")]
    RejectDontRequeue { reason: String },

    /// Acknowledge the message despite the failure and end the batch.
    #[error("listener requested immediate acknowledgement")]
    ImmediateAck,

    /// Ordinary listener failure; disposition follows the container's
    /// requeue policy.
    #[error("listener invocation failed: {reason}")]
    Failed { reason: String },

    /// The listener cannot handle messages at all (wrong shape, missing
    /// handler). Fatal for the container.
    #[error("invalid listener: {reason}")]
    InvalidListener { reason: String },
}

impl ListenerError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ListenerError::RejectDontRequeue { .. } => "listener_reject_dont_requeue",
            ListenerError::ImmediateAck => "listener_immediate_ack",
            ListenerError::Failed { .. } => "listener_failed",
            ListenerError::InvalidListener { .. } => "listener_invalid",
        }
    }

    /// True when the listener asked for an ack despite failing.
    pub fn is_immediate_ack(&self) -> bool {
        matches!(self, ListenerError::ImmediateAck)
    }

    /// True when the listener is structurally unable to process messages.
    pub fn is_invalid_listener(&self) -> bool {
        matches!(self, ListenerError::InvalidListener { .. })
    }

    /// Convenience constructor for ordinary failures.
    pub fn failed(reason: impl Into<String>) -> Self {
        ListenerError::Failed {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for reject-without-requeue.
    pub fn reject(reason: impl Into<String>) -> Self {
        ListenerError::RejectDontRequeue {
            reason: reason.into(),
        }
    }
}

/// # A worker's classification of a failure.
///
/// Produced by the worker receive loop and the consumer startup path; the
/// restart machinery maps each variant to fatal-abort, back-off-restart,
/// silent restart, or message-scoped handling.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// None of the configured queues could be declared after all retries.
    #[error("none of the configured queues are available")]
    QueuesNotAvailable {
        #[source]
        source: BrokerError,
    },

    /// Channel open failed in a way that looks like bad credentials.
    #[error("authentication failure")]
    AuthFailure {
        #[source]
        source: BrokerError,
    },

    /// Unrecoverable startup failure (e.g. mismatched queue arguments).
    #[error("fatal consumer startup failure: {reason}")]
    FatalStartup { reason: String },

    /// Unrecoverable failure during processing.
    #[error("fatal consumer execution failure: {reason}")]
    FatalExecution { reason: String },

    /// The broker cancelled this consumer's tag (queue deleted, forced
    /// cancel).
    #[error("consumer cancelled by the broker")]
    Cancelled,

    /// The worker was interrupted by shutdown while blocked.
    #[error("consumer interrupted")]
    Interrupted,

    /// A listener outcome that escaped the batch; the worker restarts unless
    /// the variant is message-scoped.
    #[error("listener error")]
    Listener(#[source] ListenerError),

    /// Any broker failure not covered above.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// External transaction failure.
    #[error(transparent)]
    Tx(#[from] TxError),
}

impl ConsumerError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConsumerError::QueuesNotAvailable { .. } => "consumer_queues_not_available",
            ConsumerError::AuthFailure { .. } => "consumer_auth_failure",
            ConsumerError::FatalStartup { .. } => "consumer_fatal_startup",
            ConsumerError::FatalExecution { .. } => "consumer_fatal_execution",
            ConsumerError::Cancelled => "consumer_cancelled",
            ConsumerError::Interrupted => "consumer_interrupted",
            ConsumerError::Listener(_) => "consumer_listener_error",
            ConsumerError::Broker(e) => e.as_label(),
            ConsumerError::Tx(_) => "consumer_tx_error",
        }
    }
}

/// # Errors produced by the container lifecycle.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ContainerError {
    /// The configuration failed validation.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// `start()` was called from a state that cannot transition to starting.
    #[error("container cannot start from state {state}")]
    NotStartable { state: &'static str },

    /// A worker recorded a fatal exception during startup.
    #[error("fatal exception on consumer startup: {reason}")]
    FatalStartup { reason: String },

    /// The listener declared expected queues that differ from the
    /// container's queue set.
    #[error("listener expects queues {expected:?}; container listens on {actual:?}")]
    QueueMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// A queue mutation would leave the container with no queues.
    #[error("at least one queue must remain configured")]
    LastQueue,

    /// A worker did not start within `consumer_start_timeout`.
    #[error("consumer failed to start within {timeout:?}")]
    StartTimeout { timeout: Duration },
}

impl ContainerError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ContainerError::Config { .. } => "container_invalid_config",
            ContainerError::NotStartable { .. } => "container_not_startable",
            ContainerError::FatalStartup { .. } => "container_fatal_startup",
            ContainerError::QueueMismatch { .. } => "container_queue_mismatch",
            ContainerError::LastQueue => "container_last_queue",
            ContainerError::StartTimeout { .. } => "container_start_timeout",
        }
    }

    /// Convenience constructor for configuration failures.
    pub fn config(reason: impl Into<String>) -> Self {
        ContainerError::Config {
            reason: reason.into(),
        }
    }
}

/// # External transaction failure.
#[derive(Error, Debug)]
#[error("transaction {op} failed: {reason}")]
pub struct TxError {
    /// Which operation failed: "begin", "commit" or "rollback".
    pub op: &'static str,
    /// Backend-provided reason.
    pub reason: String,
}

impl TxError {
    /// Creates a transaction error for the given operation.
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}
