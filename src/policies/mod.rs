//! # Recovery policies: backoff and jitter for consumer restarts.

mod backoff;
mod jitter;

pub use backoff::{BackOff, BackOffExecution, ExponentialBackOff, FixedBackOff};
pub use jitter::JitterPolicy;
