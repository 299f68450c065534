//! # Tracks currently active (consuming) workers.
//!
//! [`ActiveTracker`] counts the workers holding live broker channels so
//! shutdown can wait, bounded, for in-flight batches to finish.
//!
//! - Workers register in `QueueConsumer::start` and are released when their
//!   runner finalizes.
//! - [`ActiveTracker::await_drained`] blocks until the count reaches zero or
//!   the timeout elapses.
//! - [`ActiveTracker::deactivate`] makes any further waits return
//!   immediately; [`ActiveTracker::reset`] re-arms the tracker for the next
//!   container start.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Clone)]
struct TrackState {
    members: HashSet<u64>,
    armed: bool,
}

/// Registration counter for active workers, with bounded-wait drain.
#[derive(Clone)]
pub(crate) struct ActiveTracker {
    state: watch::Sender<TrackState>,
}

impl ActiveTracker {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(TrackState {
            members: HashSet::new(),
            armed: true,
        });
        Self { state }
    }

    /// Registers a worker as active. Idempotent per id.
    pub(crate) fn add(&self, id: u64) {
        self.state.send_modify(|s| {
            s.members.insert(id);
        });
    }

    /// Releases a worker. Unknown ids are ignored.
    pub(crate) fn release(&self, id: u64) {
        self.state.send_modify(|s| {
            s.members.remove(&id);
        });
    }

    /// Number of currently registered workers.
    pub(crate) fn count(&self) -> usize {
        self.state.borrow().members.len()
    }

    /// Waits until no workers remain active, the tracker is deactivated, or
    /// the timeout elapses. Returns true when the wait finished before the
    /// timeout.
    pub(crate) async fn await_drained(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|s| s.members.is_empty() || !s.armed))
            .await
            .is_ok();
        result
    }

    /// Makes any current and future waits return immediately.
    pub(crate) fn deactivate(&self) {
        self.state.send_modify(|s| s.armed = false);
    }

    /// Re-arms the tracker and clears stale registrations.
    pub(crate) fn reset(&self) {
        self.state.send_modify(|s| {
            s.members.clear();
            s.armed = true;
        });
    }
}
