//! Poison-tolerant lock helper for the crate's `std` mutexes.

use std::sync::{Mutex, MutexGuard};

/// Locks a `std` mutex, recovering the guard if a holder panicked.
///
/// The guarded structures stay consistent across panics (every critical
/// section is a plain field update), so continuing with the inner value is
/// safe.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
