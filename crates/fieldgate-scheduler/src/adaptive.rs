//! Per-device adaptive batch sizing.

use std::time::Duration;
use tokio::time::Instant;

/// Tuning parameters for the size controller.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    /// Average batch latency above this shrinks the size; below half of it
    /// (with a high success rate) grows it.
    pub latency_threshold: Duration,
    /// Observation window; at most one adjustment happens per window.
    pub window: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 100,
            initial_batch_size: 16,
            latency_threshold: Duration::from_millis(500),
            window: Duration::from_secs(10),
        }
    }
}

/// Latency- and success-fed batch size controller.
///
/// Shrink: `max(min, ⌊0.9 · current⌋)` when the window's average latency
/// exceeds the threshold. Grow: `min(max, ⌈1.1 · current⌉)` when the success
/// rate beats 0.95 and latency sits below half the threshold. One adjustment
/// per window, so the size cannot oscillate inside a window.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    current: usize,
    window_started: Instant,
    batches: u32,
    latency_sum: Duration,
    ok_requests: usize,
    total_requests: usize,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        let current = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        Self {
            config,
            current,
            window_started: Instant::now(),
            batches: 0,
            latency_sum: Duration::ZERO,
            ok_requests: 0,
            total_requests: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Feeds one batch observation. Returns `Some((old, new))` when the
    /// window closed with an adjustment.
    pub fn record_batch(
        &mut self,
        latency: Duration,
        ok_requests: usize,
        total_requests: usize,
    ) -> Option<(usize, usize)> {
        self.batches += 1;
        self.latency_sum += latency;
        self.ok_requests += ok_requests;
        self.total_requests += total_requests;

        if self.window_started.elapsed() < self.config.window {
            return None;
        }

        let avg_latency = self.latency_sum / self.batches.max(1);
        let success_rate = if self.total_requests > 0 {
            self.ok_requests as f64 / self.total_requests as f64
        } else {
            1.0
        };

        let old = self.current;
        let new = if avg_latency > self.config.latency_threshold {
            ((old as f64 * 0.9).floor() as usize).max(self.config.min_batch_size)
        } else if success_rate > 0.95 && avg_latency < self.config.latency_threshold / 2 {
            ((old as f64 * 1.1).ceil() as usize).min(self.config.max_batch_size)
        } else {
            old
        };

        self.window_started = Instant::now();
        self.batches = 0;
        self.latency_sum = Duration::ZERO;
        self.ok_requests = 0;
        self.total_requests = 0;

        if new != old {
            self.current = new;
            Some((old, new))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: Duration) -> AdaptiveConfig {
        AdaptiveConfig {
            min_batch_size: 4,
            max_batch_size: 64,
            initial_batch_size: 20,
            latency_threshold: Duration::from_millis(100),
            window,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_batches_shrink_the_size() {
        let mut c = AdaptiveController::new(config(Duration::from_secs(1)));
        assert!(c.record_batch(Duration::from_millis(300), 20, 20).is_none());
        tokio::time::advance(Duration::from_secs(2)).await;
        let adjusted = c.record_batch(Duration::from_millis(300), 20, 20);
        assert_eq!(adjusted, Some((20, 18)));
        assert_eq!(c.current(), 18);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_successful_batches_grow_the_size() {
        let mut c = AdaptiveController::new(config(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        let adjusted = c.record_batch(Duration::from_millis(10), 20, 20);
        assert_eq!(adjusted, Some((20, 22)));
    }

    #[tokio::test(start_paused = true)]
    async fn middling_observations_leave_the_size_alone() {
        let mut c = AdaptiveController::new(config(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        // Latency between threshold/2 and threshold: neither rule fires.
        assert!(c.record_batch(Duration::from_millis(70), 20, 20).is_none());
        assert_eq!(c.current(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn low_success_rate_blocks_growth() {
        let mut c = AdaptiveController::new(config(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(c.record_batch(Duration::from_millis(10), 10, 20).is_none());
        assert_eq!(c.current(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_adjustment_per_window() {
        let mut c = AdaptiveController::new(config(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(c.record_batch(Duration::from_millis(300), 5, 5).is_some());
        // Window restarted: another slow batch adjusts nothing yet.
        assert!(c.record_batch(Duration::from_millis(300), 5, 5).is_none());
        assert_eq!(c.current(), 18);
    }

    #[tokio::test(start_paused = true)]
    async fn size_never_leaves_the_configured_bounds() {
        let mut c = AdaptiveController::new(AdaptiveConfig {
            min_batch_size: 4,
            max_batch_size: 8,
            initial_batch_size: 5,
            latency_threshold: Duration::from_millis(100),
            window: Duration::from_millis(100),
        });
        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(200)).await;
            c.record_batch(Duration::from_secs(1), 5, 5);
            assert!(c.current() >= 4);
        }
        assert_eq!(c.current(), 4);
        for _ in 0..50 {
            tokio::time::advance(Duration::from_millis(200)).await;
            c.record_batch(Duration::from_millis(1), 5, 5);
            assert!(c.current() <= 8);
        }
        assert_eq!(c.current(), 8);
    }
}
