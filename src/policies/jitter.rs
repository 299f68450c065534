//! # Jitter for recovery delays.
//!
//! When many workers lose the broker at once they would otherwise all retry
//! on the same beat. [`JitterPolicy`] randomizes each delay to spread the
//! reconnect load.

use std::time::Duration;

use rand::Rng;

/// Randomization applied to a computed backoff delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Use the exact delay. Predictable; fine for a single worker.
    #[default]
    None,
    /// Random delay in `[0, delay]`. Most aggressive spreading.
    Full,
    /// `delay/2 + random[0, delay/2]`. Keeps ~75% of the delay on average.
    Equal,
    /// Stateful: `random[base, prev * 3]` capped at `max`. Needs the
    /// previous delay, see [`JitterPolicy::apply_decorrelated`].
    Decorrelated,
}

impl JitterPolicy {
    /// Applies jitter to `delay`.
    ///
    /// `Decorrelated` returns the input unchanged here; it needs context,
    /// use [`apply_decorrelated`](Self::apply_decorrelated).
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = clamp_ms(delay);
        match self {
            JitterPolicy::None | JitterPolicy::Decorrelated => delay,
            JitterPolicy::Full => {
                if ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::rng().random_range(0..=ms))
                }
            }
            JitterPolicy::Equal => {
                let half = ms / 2;
                if half == 0 {
                    delay
                } else {
                    Duration::from_millis(half + rand::rng().random_range(0..=half))
                }
            }
        }
    }

    /// Decorrelated jitter: `random[base, min(prev * 3, max)]`.
    ///
    /// Falls back to `apply(base)` for the stateless policies.
    pub fn apply_decorrelated(&self, base: Duration, prev: Duration, max: Duration) -> Duration {
        if !matches!(self, JitterPolicy::Decorrelated) {
            return self.apply(base);
        }
        let base_ms = clamp_ms(base);
        let upper = clamp_ms(prev).saturating_mul(3).min(clamp_ms(max)).max(base_ms);
        if base_ms >= upper {
            return base;
        }
        Duration::from_millis(rand::rng().random_range(base_ms..=upper))
    }
}

fn clamp_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let d = Duration::from_millis(500);
        assert_eq!(JitterPolicy::None.apply(d), d);
    }

    #[test]
    fn full_stays_within_bounds() {
        let d = Duration::from_millis(1000);
        for _ in 0..100 {
            assert!(JitterPolicy::Full.apply(d) <= d);
        }
    }

    #[test]
    fn equal_keeps_at_least_half() {
        let d = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = JitterPolicy::Equal.apply(d);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= d);
        }
    }

    #[test]
    fn decorrelated_respects_cap() {
        let base = Duration::from_millis(100);
        let prev = Duration::from_millis(400);
        let max = Duration::from_millis(600);
        for _ in 0..100 {
            let d = JitterPolicy::Decorrelated.apply_decorrelated(base, prev, max);
            assert!(d >= base && d <= max);
        }
    }
}
