//! Backoff interval strategies.

use std::time::Duration;

/// Computes the base delay before retry attempt `attempt` (0-indexed: the
/// delay after the first failure is `interval(0)`).
///
/// Jitter is applied by the retry policy on top of the base interval, so
/// implementations here are deterministic.
pub trait IntervalFunction: Send + Sync {
    fn interval(&self, attempt: u32) -> Duration;
}

/// The same delay before every attempt.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    delay: Duration,
}

impl FixedInterval {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl IntervalFunction for FixedInterval {
    fn interval(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `initial · (n + 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    initial: Duration,
    max: Duration,
}

impl LinearBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }
}

impl IntervalFunction for LinearBackoff {
    fn interval(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max)
    }
}

/// `min(max, initial · 2ⁿ)`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }
}

impl IntervalFunction for ExponentialBackoff {
    fn interval(&self, attempt: u32) -> Duration {
        // 2^attempt saturates well before the Duration cap matters.
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_constant() {
        let f = FixedInterval::new(Duration::from_millis(250));
        assert_eq!(f.interval(0), Duration::from_millis(250));
        assert_eq!(f.interval(7), Duration::from_millis(250));
    }

    #[test]
    fn linear_grows_by_initial() {
        let f = LinearBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(f.interval(0), Duration::from_millis(100));
        assert_eq!(f.interval(1), Duration::from_millis(200));
        assert_eq!(f.interval(4), Duration::from_millis(500));
        // capped
        assert_eq!(f.interval(100), Duration::from_secs(1));
    }

    #[test]
    fn exponential_doubles_until_capped() {
        let f = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(2));
        assert_eq!(f.interval(0), Duration::from_millis(100));
        assert_eq!(f.interval(1), Duration::from_millis(200));
        assert_eq!(f.interval(3), Duration::from_millis(800));
        assert_eq!(f.interval(5), Duration::from_secs(2));
        // enormous attempt numbers saturate instead of overflowing
        assert_eq!(f.interval(63), Duration::from_secs(2));
    }
}
