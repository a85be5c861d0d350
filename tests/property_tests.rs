//! Property tests for the quantified invariants: backoff bounds, buffer
//! accounting, adaptive size bounds.

use bytes::Bytes;
use fieldgate_buffer::{BufferConfig, BufferedMessage, MessageBuffer, OverflowPolicy};
use fieldgate_resilience::RetryPolicy;
use fieldgate_scheduler::{AdaptiveConfig, AdaptiveController};
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    /// Exponential backoff with jitter j stays within
    /// `[initial·2ⁿ·(1−j), min(max, initial·2ⁿ·(1+j))]`, modulo the clamp
    /// that keeps a jittered delay from undercutting the initial delay.
    #[test]
    fn exponential_delay_respects_jitter_bounds(
        initial_ms in 1u64..500,
        max_factor in 1u32..64,
        jitter in 0.0f64..1.0,
        attempt in 0u32..10,
    ) {
        let initial = Duration::from_millis(initial_ms);
        let max = initial * max_factor;
        let policy = RetryPolicy::builder()
            .exponential_backoff(initial, max)
            .jitter(jitter)
            .build();

        let base = initial.saturating_mul(1u32 << attempt.min(31)).min(max);
        let lower = base.mul_f64(1.0 - jitter).max(initial).min(max);
        let upper = base.mul_f64(1.0 + jitter).min(max).max(initial);

        for _ in 0..16 {
            let delay = policy.delay_for(attempt);
            prop_assert!(delay >= lower, "{delay:?} < {lower:?}");
            prop_assert!(delay <= upper, "{delay:?} > {upper:?}");
        }
    }

    /// `add; get; remove(id)` always shrinks the buffer by exactly one, and
    /// the buffer never exceeds its configured capacity.
    #[test]
    fn buffer_accounting_is_exact(
        priorities in proptest::collection::vec(0u8..10, 1..40),
        capacity in 1usize..32,
    ) {
        let buffer = MessageBuffer::open(
            BufferConfig::builder("prop")
                .max_size(capacity)
                .overflow(OverflowPolicy::EvictOldest)
                .build(),
        )
        .unwrap();

        for priority in &priorities {
            buffer
                .add(BufferedMessage::new(*priority, Bytes::from_static(b"x")))
                .unwrap();
            prop_assert!(buffer.len() <= capacity);
        }

        let before = buffer.len();
        let batch = buffer.get(1);
        prop_assert_eq!(buffer.len(), before, "get must not remove");
        if let Some(msg) = batch.first() {
            prop_assert_eq!(buffer.remove(&[msg.id]), 1);
            prop_assert_eq!(buffer.len(), before - 1);
        }
    }

    /// `get` returns priority bands in descending order.
    #[test]
    fn buffer_drains_higher_priority_first(
        priorities in proptest::collection::vec(0u8..10, 1..40),
    ) {
        let buffer = MessageBuffer::open(
            BufferConfig::builder("prop").max_size(64).build(),
        )
        .unwrap();
        for priority in &priorities {
            buffer
                .add(BufferedMessage::new(*priority, Bytes::from_static(b"x")))
                .unwrap();
        }

        let drained = buffer.get(priorities.len());
        let out: Vec<u8> = drained.iter().map(|m| m.priority).collect();
        let mut sorted = out.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        prop_assert_eq!(out, sorted);
    }

    /// Adaptive batch size stays inside `[min, max]` no matter what the
    /// controller observes.
    #[test]
    fn adaptive_size_stays_in_bounds(
        observations in proptest::collection::vec(
            (0u64..2_000, 0usize..100usize, 1usize..100usize),
            1..100,
        ),
        min in 1usize..8,
        span in 0usize..32,
    ) {
        let max = min + span;
        let mut controller = AdaptiveController::new(AdaptiveConfig {
            min_batch_size: min,
            max_batch_size: max,
            initial_batch_size: (min + max) / 2,
            latency_threshold: Duration::from_millis(100),
            // Zero-length window: every observation may adjust.
            window: Duration::ZERO,
        });

        for (latency_ms, ok, total) in observations {
            let ok = ok.min(total);
            controller.record_batch(Duration::from_millis(latency_ms), ok, total);
            prop_assert!(controller.current() >= min);
            prop_assert!(controller.current() <= max);
        }
    }
}
