//! Cancellation-and-deadline context threaded through every public entry
//! point.
//!
//! Deadlines propagate downward: the scheduler dispatches with
//! `min(request.deadline, context.deadline)`. Cancellation propagates through
//! child tokens, so cancelling a parent context cancels everything spawned
//! under it without affecting siblings.

use crate::error::GatewayError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// An operation context carrying a cancellation signal and an optional
/// deadline.
#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context with no deadline, cancelled only explicitly.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child of `self` with a deadline no later than `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// A child of `self` expiring `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child context sharing the deadline; cancelling the child does not
    /// cancel the parent.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// Requests cancellation of this context and all children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The earlier of this context's deadline and `other`.
    pub fn effective_deadline(&self, other: Option<Instant>) -> Option<Instant> {
        min_deadline(self.deadline, other)
    }

    /// Whether the deadline has already elapsed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time until the deadline, `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails fast with `Cancelled` or `Timeout` when the context is no
    /// longer live.
    pub fn check(&self) -> Result<(), GatewayError> {
        if self.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        if self.is_expired() {
            return Err(GatewayError::Timeout);
        }
        Ok(())
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Runs `fut` until completion, cancellation, or deadline, whichever
    /// comes first.
    pub async fn run<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(GatewayError::Timeout),
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(GatewayError::Cancelled),
                    result = fut => result,
                }
            }
        }
    }

    /// Sleeps for `duration`, waking early with `Cancelled`/`Timeout` when
    /// the context dies first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), GatewayError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

fn min_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
