//! Events emitted by the resilience primitives.

use crate::circuit::CircuitState;
use fieldgate_core::events::GatewayEvent;
use std::time::{Duration, Instant};

/// Events emitted by [`RetryPolicy`](crate::RetryPolicy).
#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// A retry is about to be scheduled after a failed attempt.
    Retry {
        name: String,
        timestamp: Instant,
        /// 1-indexed retry number (1 = first retry).
        attempt: usize,
        delay: Duration,
    },
    /// The operation succeeded, possibly after retries.
    Success {
        name: String,
        timestamp: Instant,
        /// Total attempts made including the initial one.
        attempts: usize,
    },
    /// All attempts were exhausted and the final error is being returned.
    Exhausted {
        name: String,
        timestamp: Instant,
        attempts: usize,
    },
    /// A terminal error occurred and was not retried.
    TerminalError {
        name: String,
        timestamp: Instant,
    },
}

impl GatewayEvent for RetryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RetryEvent::Retry { .. } => "retry",
            RetryEvent::Success { .. } => "success",
            RetryEvent::Exhausted { .. } => "exhausted",
            RetryEvent::TerminalError { .. } => "terminal_error",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            RetryEvent::Retry { timestamp, .. }
            | RetryEvent::Success { timestamp, .. }
            | RetryEvent::Exhausted { timestamp, .. }
            | RetryEvent::TerminalError { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        match self {
            RetryEvent::Retry { name, .. }
            | RetryEvent::Success { name, .. }
            | RetryEvent::Exhausted { name, .. }
            | RetryEvent::TerminalError { name, .. } => name,
        }
    }
}

/// Events emitted by [`CircuitBreaker`](crate::CircuitBreaker).
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    StateTransition {
        name: String,
        timestamp: Instant,
        from: CircuitState,
        to: CircuitState,
    },
    CallPermitted {
        name: String,
        timestamp: Instant,
        state: CircuitState,
    },
    CallRejected {
        name: String,
        timestamp: Instant,
    },
}

impl GatewayEvent for CircuitEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CircuitEvent::StateTransition { .. } => "state_transition",
            CircuitEvent::CallPermitted { .. } => "call_permitted",
            CircuitEvent::CallRejected { .. } => "call_rejected",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            CircuitEvent::StateTransition { timestamp, .. }
            | CircuitEvent::CallPermitted { timestamp, .. }
            | CircuitEvent::CallRejected { timestamp, .. } => *timestamp,
        }
    }

    fn component(&self) -> &str {
        match self {
            CircuitEvent::StateTransition { name, .. }
            | CircuitEvent::CallPermitted { name, .. }
            | CircuitEvent::CallRejected { name, .. } => name,
        }
    }
}
