//! Consecutive-failure circuit breaker.

use crate::events::CircuitEvent;
use fieldgate_core::events::{EventListeners, FnListener};
use fieldgate_core::GatewayError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// Calls flow through; consecutive failures are counted.
    Closed = 0,
    /// Calls are rejected until the reset timeout elapses.
    Open = 1,
    /// A bounded number of probe calls are admitted.
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Configuration for a [`CircuitBreaker`].
pub struct CircuitBreakerConfig {
    pub(crate) max_failures: u32,
    pub(crate) reset_timeout: Duration,
    pub(crate) max_half_open_calls: u32,
    pub(crate) name: String,
    pub(crate) listeners: EventListeners<CircuitEvent>,
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Consumes the config and produces a shareable breaker.
    pub fn into_breaker(self) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(self))
    }
}

/// Builder for [`CircuitBreakerConfig`].
pub struct CircuitBreakerConfigBuilder {
    max_failures: u32,
    reset_timeout: Duration,
    max_half_open_calls: u32,
    name: String,
    listeners: EventListeners<CircuitEvent>,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    /// Defaults: 5 consecutive failures open the circuit, 30s reset timeout,
    /// 1 half-open probe.
    pub fn new() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            max_half_open_calls: 1,
            name: "<unnamed>".to_string(),
            listeners: EventListeners::new(),
        }
    }

    /// Consecutive failures required to open the circuit.
    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// How long the circuit stays open before admitting probes.
    pub fn reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    /// Concurrent probes admitted in half-open; all must succeed to close.
    pub fn max_half_open_calls(mut self, calls: u32) -> Self {
        self.max_half_open_calls = calls.max(1);
        self
    }

    /// Name used in events, logs, and metric labels.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Registers a callback for state transitions.
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if let CircuitEvent::StateTransition { from, to, .. } = event {
                f(*from, *to);
            }
        }));
        self
    }

    /// Registers a callback for rejected calls.
    pub fn on_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if matches!(event, CircuitEvent::CallRejected { .. }) {
                f();
            }
        }));
        self
    }

    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures: self.max_failures,
            reset_timeout: self.reset_timeout,
            max_half_open_calls: self.max_half_open_calls,
            name: self.name,
            listeners: self.listeners,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
    half_open_inflight: u32,
    half_open_successes: u32,
}

/// A consecutive-failure circuit breaker guarding one dependency.
///
/// Cheap to share: acquisition takes one short mutex; the current state is
/// also mirrored in an atomic for lock-free observation.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
    state_atomic: AtomicU8,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_transition: Instant::now(),
                half_open_inflight: 0,
                half_open_successes: 0,
            }),
            state_atomic: AtomicU8::new(CircuitState::Closed as u8),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Lock-free view of the current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state_atomic.load(Ordering::Acquire))
    }

    /// Time since the most recent recorded failure, if any.
    pub fn last_failure_age(&self) -> Option<Duration> {
        self.inner.lock().last_failure.map(|t| t.elapsed())
    }

    /// Consecutive failures observed in the closed state.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Requests admission for one call.
    ///
    /// Returns a [`CallPermit`] that must be resolved with
    /// [`CallPermit::success`] or [`CallPermit::failure`]; dropping the
    /// permit unresolved releases any half-open slot without counting either
    /// way (used for cancelled calls).
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, GatewayError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                self.emit_permitted(inner.state);
                Ok(CallPermit::new(self))
            }
            CircuitState::Open => {
                if inner.last_transition.elapsed() >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_inflight = 1;
                    self.emit_permitted(inner.state);
                    Ok(CallPermit::new(self))
                } else {
                    drop(inner);
                    self.emit_rejected();
                    Err(GatewayError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_inflight < self.config.max_half_open_calls {
                    inner.half_open_inflight += 1;
                    self.emit_permitted(inner.state);
                    Ok(CallPermit::new(self))
                } else {
                    drop(inner);
                    self.emit_rejected();
                    Err(GatewayError::CircuitOpen)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.max_half_open_calls {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A straggler from before the circuit opened; its success tells
            // us nothing about the current window.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.max_failures {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn record_discard(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Instant::now();
        inner.half_open_inflight = 0;
        inner.half_open_successes = 0;
        if to == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
        self.state_atomic.store(to as u8, Ordering::Release);

        tracing::info!(
            breaker = %self.config.name,
            from = from.label(),
            to = to.label(),
            "circuit state transition"
        );
        metrics::counter!(
            "fieldgate_circuit_transitions_total",
            "breaker" => self.config.name.clone(),
            "from" => from.label(),
            "to" => to.label(),
        )
        .increment(1);
        metrics::gauge!(
            "fieldgate_circuit_state",
            "breaker" => self.config.name.clone(),
        )
        .set(to as u8 as f64);

        self.config.listeners.emit(&CircuitEvent::StateTransition {
            name: self.config.name.clone(),
            timestamp: std::time::Instant::now(),
            from,
            to,
        });
    }

    fn emit_permitted(&self, state: CircuitState) {
        if !self.config.listeners.is_empty() {
            self.config.listeners.emit(&CircuitEvent::CallPermitted {
                name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                state,
            });
        }
    }

    fn emit_rejected(&self) {
        metrics::counter!(
            "fieldgate_circuit_rejections_total",
            "breaker" => self.config.name.clone(),
        )
        .increment(1);
        self.config.listeners.emit(&CircuitEvent::CallRejected {
            name: self.config.name.clone(),
            timestamp: std::time::Instant::now(),
        });
    }
}

/// An admitted call. Must be resolved exactly once.
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    resolved: bool,
}

impl CallPermit {
    fn new(breaker: &Arc<CircuitBreaker>) -> Self {
        Self {
            breaker: Arc::clone(breaker),
            resolved: false,
        }
    }

    /// Reports the call as successful.
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    /// Reports the call as failed.
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.record_discard();
        }
    }
}
