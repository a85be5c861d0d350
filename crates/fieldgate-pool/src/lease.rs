//! Leases: time-bounded borrows of pooled connections.

use crate::events::PoolEvent;
use crate::pool::{Bucket, IdleConn, PoolShared};
use fieldgate_core::{ErrorClass, GatewayError};
use fieldgate_protocol::DeviceSession;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

/// A borrow of one pooled connection for the duration of one operation.
///
/// The pool retains ownership; the lease only carries the session and the
/// capacity permits. Resolving the lease decides the connection's fate:
///
/// - [`report_success`](Lease::report_success) returns it to the idle set.
/// - [`report_failure`](Lease::report_failure) returns it only for
///   terminal protocol errors (the transport is presumed healthy); for
///   transport-suspect failures and cancellations the connection is
///   discarded.
/// - Dropping an unresolved lease counts as success-without-report.
///
/// Breaker accounting for operation outcomes happens in the dispatch path
/// (the resilience manager shares the device's breaker); the lease itself
/// only manages connection disposal and device statistics.
pub struct Lease {
    shared: Arc<PoolShared>,
    bucket: Arc<Bucket>,
    session: Option<Box<dyn DeviceSession>>,
    _device_permit: OwnedSemaphorePermit,
    _total_permit: OwnedSemaphorePermit,
}

impl Lease {
    pub(crate) fn new(
        shared: Arc<PoolShared>,
        bucket: Arc<Bucket>,
        session: Box<dyn DeviceSession>,
        device_permit: OwnedSemaphorePermit,
        total_permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            shared,
            bucket,
            session: Some(session),
            _device_permit: device_permit,
            _total_permit: total_permit,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.bucket.device.id
    }

    /// The leased session. Exclusive for the lease's lifetime: no two
    /// concurrent handler invocations ever share one connection.
    pub fn session(&mut self) -> &mut dyn DeviceSession {
        // Resolution consumes the lease, so the session is present for the
        // lease's entire lifetime.
        self.session
            .as_mut()
            .map(|s| s.as_mut())
            .expect("lease session present until resolved")
    }

    /// Declares the operation successful and returns the connection.
    pub fn report_success(mut self) {
        self.bucket.record_outcome(true);
        self.resolve(true);
    }

    /// Declares the operation failed with a classified error.
    pub fn report_failure(mut self, err: &GatewayError) {
        self.bucket.record_outcome(false);
        *self.bucket.last_error.lock() = Some(err.clone());
        // Terminal protocol errors (invalid address, not writable, ...) say
        // nothing about the transport; keep the connection. Anything
        // transport-suspect is discarded, a cancelled operation included
        // since its response may still be in flight.
        let keep = err.class() == ErrorClass::Terminal;
        self.resolve(keep);
    }

    fn resolve(&mut self, keep: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        let pool_open = !self.shared.closed.load(Ordering::Acquire)
            && !self.bucket.closed.load(Ordering::Acquire);

        if keep && pool_open && session.is_connected() {
            self.bucket.idle.lock().push_back(IdleConn {
                session,
                last_used: Instant::now(),
            });
        } else {
            // Dropping the session closes the transport.
            drop(session);
            self.bucket.live.fetch_sub(1, Ordering::AcqRel);
            self.shared.emit(PoolEvent::ConnectionClosed {
                device: self.bucket.device.id.clone(),
                timestamp: std::time::Instant::now(),
                reason: "discarded",
            });
            self.shared.record_pool_size();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.resolve(true);
    }
}
