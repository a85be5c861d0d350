//! Composition of retry and circuit breaking.

use crate::circuit::CircuitBreaker;
use crate::retry::RetryPolicy;
use fieldgate_core::{GatewayError, OpContext};
use std::future::Future;
use std::sync::Arc;

/// Executes operations as `retry(circuit_breaker(op))`.
///
/// The breaker is consulted before every attempt; while it is open the
/// caller sees [`GatewayError::CircuitOpen`] immediately, without the
/// operation being invoked and without burning retry attempts. Terminal
/// failures bypass retry per the [`GatewayError`] classification, and
/// cancellation never counts against the breaker.
#[derive(Clone)]
pub struct ResilienceManager {
    name: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl ResilienceManager {
    pub fn new(name: impl Into<String>, retry: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            name: name.into(),
            retry,
            breaker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker guarding this manager's dependency. Shared so other
    /// components (e.g. the pool's reconnect path) can feed the same
    /// failure window.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Runs `op` under the breaker, retrying retryable failures.
    ///
    /// The closure receives the 0-indexed attempt number and is invoked at
    /// most once per admitted attempt.
    pub async fn execute<T, F, Fut>(&self, ctx: &OpContext, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let breaker = &self.breaker;
        self.retry
            .execute_classified(
                ctx,
                // An open circuit is reported to the caller immediately;
                // waiting out the reset timeout inside the retry loop would
                // just hide the condition.
                |e| e.is_retryable() && !matches!(e, GatewayError::CircuitOpen),
                move |attempt| {
                    let admitted = breaker.try_acquire().map(|permit| (permit, op(attempt)));
                    async move {
                        let (permit, fut) = admitted?;
                        match fut.await {
                            Ok(value) => {
                                permit.success();
                                Ok(value)
                            }
                            Err(err) => {
                                if err.is_cancellation() {
                                    // Neither success nor failure: release
                                    // any half-open slot without counting.
                                    drop(permit);
                                } else {
                                    permit.failure();
                                }
                                Err(err)
                            }
                        }
                    }
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager(max_failures: u32, max_retries: usize) -> ResilienceManager {
        let retry = RetryPolicy::builder()
            .max_retries(max_retries)
            .fixed_backoff(Duration::from_millis(10))
            .name("test")
            .build();
        let breaker = CircuitBreakerConfig::builder()
            .max_failures(max_failures)
            .reset_timeout(Duration::from_secs(5))
            .name("test")
            .build()
            .into_breaker();
        ResilienceManager::new("test", retry, breaker)
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_success_is_one_caller_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let m = manager(10, 3);
        let ctx = OpContext::background();
        let result = m
            .execute(&ctx, move |_attempt| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GatewayError::Transport("reset".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(m.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_short_circuits_without_invoking_op() {
        let m = manager(2, 3);
        let ctx = OpContext::background();

        // Trip the breaker.
        for _ in 0..2 {
            let _ = m
                .execute(&ctx, |_attempt| async {
                    Err::<(), _>(GatewayError::ProtocolException {
                        code: 4,
                        retryable: false,
                    })
                })
                .await;
        }
        assert_eq!(m.breaker().state(), CircuitState::Open);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: Result<(), _> = m
            .execute(&ctx, move |_attempt| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(GatewayError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_recovers_through_half_open() {
        let m = manager(1, 0);
        let ctx = OpContext::background();

        let _ = m
            .execute(&ctx, |_attempt| async {
                Err::<(), _>(GatewayError::Transport("reset".into()))
            })
            .await;
        assert_eq!(m.breaker().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        let result = m.execute(&ctx, |_attempt| async { Ok(1u8) }).await;
        assert_eq!(result, Ok(1));
        assert_eq!(m.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failures_skip_retry_but_feed_the_breaker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let m = manager(1, 5);
        let ctx = OpContext::background();
        let result: Result<(), _> = m
            .execute(&ctx, move |_attempt| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::NotWritable) }
            })
            .await;

        assert_eq!(result, Err(GatewayError::NotWritable));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(m.breaker().state(), CircuitState::Open);
    }
}
