//! # Scaling decisions: hysteresis for the elastic worker pool.
//!
//! Two mechanisms dampen flapping:
//! - the *n-consecutive* triggers ([`ConsecutiveTracker`]) suppress reaction
//!   to a single busy or idle receive cycle;
//! - the min-interval checks ([`ScalingCell`]) space successive scale-ups
//!   and scale-downs apart under bursty load.
//!
//! The cell also carries the mutable scaling bounds; it lives inside the
//! worker set and is only touched under the worker-set lock.

use std::time::Duration;

use tokio::time::Instant;

/// Mutable scaling state: bounds plus the last start/stop instants.
#[derive(Debug, Clone)]
pub(crate) struct ScalingCell {
    /// Lower bound of the worker pool (and its initial size).
    pub min: usize,
    /// Upper bound of the worker pool.
    pub max: usize,
    last_started: Option<Instant>,
    last_stopped: Option<Instant>,
}

impl ScalingCell {
    pub(crate) fn new(min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            last_started: None,
            last_stopped: None,
        }
    }

    /// True when scaling is enabled at all.
    pub(crate) fn elastic(&self) -> bool {
        self.max > self.min
    }

    /// May another worker start now, given the current pool size?
    pub(crate) fn may_start(&self, now: Instant, current: usize, min_interval: Duration) -> bool {
        current < self.max
            && self
                .last_started
                .map_or(true, |last| now >= last + min_interval)
    }

    /// May an idle worker stop now, given the current pool size?
    pub(crate) fn may_stop(&self, now: Instant, current: usize, min_interval: Duration) -> bool {
        current > self.min
            && self
                .last_stopped
                .map_or(true, |last| now >= last + min_interval)
    }

    pub(crate) fn note_started(&mut self, now: Instant) {
        self.last_started = Some(now);
    }

    pub(crate) fn note_stopped(&mut self, now: Instant) {
        self.last_stopped = Some(now);
    }
}

/// What the consecutive counters suggest after one receive cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleHint {
    ConsiderAdd,
    ConsiderRemove,
    Hold,
}

/// Per-worker counters of consecutive busy/idle receive cycles.
///
/// A busy cycle resets the idle counter and vice versa; a hint fires once
/// the respective counter exceeds its trigger and resets it.
#[derive(Debug)]
pub(crate) struct ConsecutiveTracker {
    active: u32,
    idle: u32,
    active_trigger: u32,
    idle_trigger: u32,
}

impl ConsecutiveTracker {
    pub(crate) fn new(active_trigger: u32, idle_trigger: u32) -> Self {
        Self {
            active: 0,
            idle: 0,
            active_trigger,
            idle_trigger,
        }
    }

    /// Records one receive cycle and returns the scaling suggestion.
    pub(crate) fn record(&mut self, received: bool) -> ScaleHint {
        if received {
            self.idle = 0;
            self.active += 1;
            if self.active > self.active_trigger {
                self.active = 0;
                return ScaleHint::ConsiderAdd;
            }
        } else {
            self.active = 0;
            self.idle += 1;
            if self.idle > self.idle_trigger {
                self.idle = 0;
                return ScaleHint::ConsiderRemove;
            }
        }
        ScaleHint::Hold
    }
}
