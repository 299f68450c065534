//! # Container lifecycle events.
//!
//! [`EventKind`] classifies what happened; [`Event`] carries the metadata.
//! Events are the container's side output: consumer churn, restarts, idle
//! alerts, and failures (with their fatality) all surface here so operators
//! can alert on them without scraping logs.
//!
//! ## Ordering
//! Each event carries a globally unique, monotonically increasing `seq` so
//! subscribers can re-order events delivered through async channels.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of container events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A consumer was created and submitted to the runtime.
    ConsumerStarted,
    /// A consumer terminated (shutdown, scale-down, or abort).
    ConsumerStopped,
    /// A failed consumer was replaced by a fresh one.
    ConsumerRestarted,
    /// No message was received for at least the configured idle interval.
    ContainerIdle,
    /// A consumer failed; `fatal` tells whether the container is stopping.
    ConsumerFailed,
}

/// One lifecycle event with optional metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (for logging; may go backwards under NTP).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Name of the consumer involved, if any.
    pub consumer: Option<String>,
    /// For restarts: the name of the replacement consumer.
    pub replacement: Option<String>,
    /// Human-readable reason, for failures.
    pub reason: Option<String>,
    /// Error display string, for failures.
    pub error: Option<String>,
    /// Whether the failure was fatal for the container.
    pub fatal: Option<bool>,
    /// For idle events: how long the container has been idle.
    pub idle_for: Option<Duration>,
    /// For idle events: the queues being listened on.
    pub queues: Option<Vec<String>>,
}

impl Event {
    /// Creates an event of the given kind, stamped now.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            consumer: None,
            replacement: None,
            reason: None,
            error: None,
            fatal: None,
            idle_for: None,
            queues: None,
        }
    }

    /// Attaches the consumer name.
    pub fn with_consumer(mut self, name: impl Into<String>) -> Self {
        self.consumer = Some(name.into());
        self
    }

    /// Attaches the replacement consumer name (restarts).
    pub fn with_replacement(mut self, name: impl Into<String>) -> Self {
        self.replacement = Some(name.into());
        self
    }

    /// Attaches a failure reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches an error display string.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attaches the fatality flag.
    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// Attaches the idle duration.
    pub fn with_idle_for(mut self, idle_for: Duration) -> Self {
        self.idle_for = Some(idle_for);
        self
    }

    /// Attaches the queue set.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = Some(queues);
        self
    }
}
