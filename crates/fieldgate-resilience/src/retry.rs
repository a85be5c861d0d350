//! Retry executor with pluggable backoff and jitter.

use crate::backoff::{ExponentialBackoff, FixedInterval, IntervalFunction, LinearBackoff};
use crate::events::RetryEvent;
use fieldgate_core::events::{EventListeners, FnListener};
use fieldgate_core::{GatewayError, OpContext};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A retry policy: attempt bound, backoff strategy, jitter factor.
///
/// `max_retries` counts retries, not attempts: `max_retries = 3` allows up
/// to 4 invocations of the operation.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    interval: Arc<dyn IntervalFunction>,
    jitter: f64,
    /// Lower clamp applied after jitter so a jittered delay never drops
    /// below the configured initial delay.
    floor: Duration,
    ceiling: Duration,
    name: String,
    listeners: EventListeners<RetryEvent>,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// The jittered, clamped delay before retry `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.interval.interval(attempt);
        let jittered = if self.jitter > 0.0 {
            let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            base.mul_f64(factor)
        } else {
            base
        };
        jittered.clamp(self.floor, self.ceiling)
    }

    /// Runs `op` until success, a non-retryable failure, retry exhaustion,
    /// or context cancellation. The closure receives the 0-indexed attempt
    /// number.
    pub async fn execute<T, F, Fut>(&self, ctx: &OpContext, op: F) -> Result<T, GatewayError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.execute_classified(ctx, GatewayError::is_retryable, op)
            .await
    }

    /// Like [`execute`](Self::execute), with a caller-supplied retryability
    /// predicate. Cancellation-family errors are never retried regardless of
    /// the predicate.
    pub async fn execute_classified<T, F, Fut, P>(
        &self,
        ctx: &OpContext,
        retry_on: P,
        mut op: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
        P: Fn(&GatewayError) -> bool,
    {
        let mut attempt: usize = 0;
        loop {
            ctx.check()?;
            metrics::counter!(
                "fieldgate_retry_attempts_total",
                "policy" => self.name.clone(),
            )
            .increment(1);

            match op(attempt).await {
                Ok(value) => {
                    self.listeners.emit(&RetryEvent::Success {
                        name: self.name.clone(),
                        timestamp: std::time::Instant::now(),
                        attempts: attempt + 1,
                    });
                    return Ok(value);
                }
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) if !retry_on(&err) => {
                    self.listeners.emit(&RetryEvent::TerminalError {
                        name: self.name.clone(),
                        timestamp: std::time::Instant::now(),
                    });
                    return Err(err);
                }
                Err(err) => {
                    if attempt >= self.max_retries {
                        tracing::warn!(
                            policy = %self.name,
                            attempts = attempt + 1,
                            error = %err,
                            "retries exhausted"
                        );
                        metrics::counter!(
                            "fieldgate_retry_exhausted_total",
                            "policy" => self.name.clone(),
                        )
                        .increment(1);
                        self.listeners.emit(&RetryEvent::Exhausted {
                            name: self.name.clone(),
                            timestamp: std::time::Instant::now(),
                            attempts: attempt + 1,
                        });
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt as u32);
                    tracing::debug!(
                        policy = %self.name,
                        attempt = attempt + 1,
                        ?delay,
                        error = %err,
                        "scheduling retry"
                    );
                    self.listeners.emit(&RetryEvent::Retry {
                        name: self.name.clone(),
                        timestamp: std::time::Instant::now(),
                        attempt: attempt + 1,
                        delay,
                    });
                    ctx.sleep(delay).await?;
                    attempt += 1;
                }
            }
        }
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_retries: usize,
    interval: Option<Arc<dyn IntervalFunction>>,
    jitter: f64,
    floor: Duration,
    ceiling: Duration,
    name: String,
    listeners: EventListeners<RetryEvent>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    /// Defaults: 3 retries, exponential backoff 100ms → 30s, no jitter.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            interval: None,
            jitter: 0.0,
            floor: Duration::from_millis(100),
            ceiling: Duration::from_secs(30),
            name: "<unnamed>".to_string(),
            listeners: EventListeners::new(),
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The same delay before every retry.
    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.interval = Some(Arc::new(FixedInterval::new(delay)));
        self.floor = delay;
        self.ceiling = delay.max(self.ceiling);
        self
    }

    /// `initial · (n + 1)`, capped at `max`.
    pub fn linear_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.interval = Some(Arc::new(LinearBackoff::new(initial, max)));
        self.floor = initial;
        self.ceiling = max.max(initial);
        self
    }

    /// `min(max, initial · 2ⁿ)`.
    pub fn exponential_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.interval = Some(Arc::new(ExponentialBackoff::new(initial, max)));
        self.floor = initial;
        self.ceiling = max.max(initial);
        self
    }

    /// Multiplicative jitter factor in `[0, 1]`: each delay is scaled by a
    /// uniform draw from `[1 − j, 1 + j]`, then clamped to the configured
    /// initial/max bounds.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Callback invoked before each retry delay with `(attempt, delay)`.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, Duration) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if let RetryEvent::Retry { attempt, delay, .. } = event {
                f(*attempt, *delay);
            }
        }));
        self
    }

    /// Callback invoked on success with the total attempt count.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if let RetryEvent::Success { attempts, .. } = event {
                f(*attempts);
            }
        }));
        self
    }

    /// Callback invoked when retries are exhausted.
    pub fn on_exhausted<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if let RetryEvent::Exhausted { attempts, .. } = event {
                f(*attempts);
            }
        }));
        self
    }

    pub fn build(self) -> RetryPolicy {
        let interval = self.interval.unwrap_or_else(|| {
            Arc::new(ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_secs(30),
            ))
        });
        RetryPolicy {
            max_retries: self.max_retries,
            interval,
            jitter: self.jitter,
            floor: self.floor,
            ceiling: self.ceiling,
            name: self.name,
            listeners: self.listeners,
        }
    }
}
