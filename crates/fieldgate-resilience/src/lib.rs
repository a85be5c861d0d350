//! Resilience primitives for the fieldgate gateway.
//!
//! Two building blocks and one composition:
//!
//! - [`RetryPolicy`]: retries an async operation with a pluggable backoff
//!   strategy (fixed, linear, exponential) and multiplicative jitter. The
//!   operation's [`GatewayError`] classification decides retryability;
//!   terminal failures return immediately and cancellation aborts any
//!   pending backoff sleep.
//! - [`CircuitBreaker`]: a consecutive-failure breaker. `Closed` opens after
//!   `max_failures` consecutive failures, `Open` rejects with
//!   [`GatewayError::CircuitOpen`] until `reset_timeout` elapses, then
//!   `HalfOpen` admits a bounded number of concurrent probes. The first
//!   probe failure reopens; once all admitted probes succeed the breaker
//!   closes.
//! - [`ResilienceManager`]: `retry(circuit_breaker(op))`. An open circuit is
//!   reported to the caller immediately, without burning retry attempts.
//!
//! Every primitive emits typed events through
//! [`fieldgate_core::EventListeners`] and metrics through the `metrics`
//! facade.
//!
//! # Example
//!
//! ```
//! use fieldgate_resilience::{CircuitBreakerConfig, ResilienceManager, RetryPolicy};
//! use fieldgate_core::{GatewayError, OpContext};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), GatewayError> {
//! let retry = RetryPolicy::builder()
//!     .max_retries(3)
//!     .exponential_backoff(Duration::from_millis(100), Duration::from_secs(5))
//!     .jitter(0.2)
//!     .build();
//! let breaker = CircuitBreakerConfig::builder()
//!     .max_failures(5)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build()
//!     .into_breaker();
//!
//! let manager = ResilienceManager::new("plc-1", retry, breaker);
//! let ctx = OpContext::background().with_timeout(Duration::from_secs(2));
//! let value = manager
//!     .execute(&ctx, |_attempt| async { Ok::<_, GatewayError>(21 * 2) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

mod backoff;
mod circuit;
mod events;
mod manager;
mod retry;

pub use backoff::{ExponentialBackoff, FixedInterval, IntervalFunction, LinearBackoff};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitState};
pub use events::{CircuitEvent, RetryEvent};
pub use manager::ResilienceManager;
pub use retry::{RetryPolicy, RetryPolicyBuilder};
