//! The connection pool proper.

use crate::config::PoolConfig;
use crate::events::PoolEvent;
use crate::lease::Lease;
use fieldgate_core::{
    Device, DeviceId, GatewayError, HealthSnapshot, HealthState, OpContext,
};
use fieldgate_protocol::{DeviceSession, HandlerRegistry, ProtocolHandler};
use fieldgate_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Window over which per-device error rates are computed.
const ERROR_WINDOW: Duration = Duration::from_secs(60);

pub(crate) struct IdleConn {
    pub session: Box<dyn DeviceSession>,
    pub last_used: Instant,
}

/// Point-in-time connection accounting for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus leased connections.
    pub live: usize,
    /// Connections parked in the idle set.
    pub idle: usize,
    /// Connections currently out on a lease.
    pub in_use: usize,
    /// Acquisitions waiting for a lease slot.
    pub waiters: usize,
}

pub(crate) struct Bucket {
    pub device: Device,
    pub handler: Arc<dyn ProtocolHandler>,
    pub sem: Arc<Semaphore>,
    pub idle: Mutex<VecDeque<IdleConn>>,
    pub breaker: Arc<CircuitBreaker>,
    /// Idle + leased connections.
    pub live: AtomicUsize,
    /// Acquisitions currently waiting on the device's lease slots.
    pub waiters: AtomicUsize,
    pub closed: AtomicBool,
    pub last_comm: Mutex<Option<SystemTime>>,
    pub last_error: Mutex<Option<GatewayError>>,
    /// Recent operation outcomes `(when, ok)` for the error-rate window.
    pub outcomes: Mutex<VecDeque<(Instant, bool)>>,
    pub registered_at: Instant,
}

impl Bucket {
    pub(crate) fn record_outcome(&self, ok: bool) {
        let now = Instant::now();
        if ok {
            *self.last_comm.lock() = Some(SystemTime::now());
        }
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back((now, ok));
        while outcomes
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) > ERROR_WINDOW)
        {
            outcomes.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        let now = Instant::now();
        let outcomes = self.outcomes.lock();
        let recent: Vec<bool> = outcomes
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= ERROR_WINDOW)
            .map(|(_, ok)| *ok)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let failures = recent.iter().filter(|ok| !**ok).count();
        failures as f64 / recent.len() as f64
    }
}

pub(crate) struct PoolShared {
    pub config: PoolConfig,
    pub registry: HandlerRegistry,
    pub buckets: Mutex<HashMap<DeviceId, Arc<Bucket>>>,
    pub total_sem: Arc<Semaphore>,
    pub closed: AtomicBool,
    pub cancel: CancellationToken,
}

impl PoolShared {
    pub(crate) fn emit(&self, event: PoolEvent) {
        self.config.listeners.emit(&event);
    }

    pub(crate) fn record_pool_size(&self) {
        let total: usize = self
            .buckets
            .lock()
            .values()
            .map(|b| b.live.load(Ordering::Relaxed))
            .sum();
        metrics::gauge!("fieldgate_pool_connections").set(total as f64);
    }
}

/// Pools transports per device and leases them out one operation at a time.
///
/// - At most `max_per_device` live connections per device and `max_total`
///   overall; oversubscribed acquisitions wait FIFO up to `connect_timeout`
///   and then fail with [`GatewayError::PoolExhausted`].
/// - Each device owns one circuit breaker, exposed through
///   [`breaker`](ConnectionPool::breaker). The dispatch path wraps its
///   operations (lease acquisition included) in that breaker; the pool
///   itself consults it only for health-tick reconnects, so a failure is
///   never counted twice.
/// - A background task probes idle connections every
///   `health_check_interval`, evicts those idle past `idle_timeout`, and
///   attempts breaker-guarded reconnects for probe failures.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Creates the pool and spawns its health-check task.
    pub fn new(config: PoolConfig, registry: HandlerRegistry) -> Self {
        let max_total = config.max_total;
        let interval = config.health_check_interval;
        let shared = Arc::new(PoolShared {
            config,
            registry,
            buckets: Mutex::new(HashMap::new()),
            total_sem: Arc::new(Semaphore::new(max_total)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let health_shared = Arc::clone(&shared);
        let health_task = tokio::spawn(async move {
            health_loop(health_shared, interval).await;
        });

        Self {
            shared,
            health_task: Mutex::new(Some(health_task)),
        }
    }

    /// Creates the pool bucket for a device. Idempotent per device id.
    pub fn register_device(&self, device: Device) -> Result<(), GatewayError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Shutdown);
        }
        let handler = self.shared.registry.get(device.protocol)?;
        let mut buckets = self.shared.buckets.lock();
        if buckets.contains_key(&device.id) {
            return Ok(());
        }

        let breaker = CircuitBreakerConfig::builder()
            .max_failures(self.shared.config.breaker_max_failures)
            .reset_timeout(self.shared.config.breaker_reset_timeout)
            .name(device.id.clone())
            .build()
            .into_breaker();

        buckets.insert(
            device.id.clone(),
            Arc::new(Bucket {
                handler,
                sem: Arc::new(Semaphore::new(self.shared.config.max_per_device)),
                idle: Mutex::new(VecDeque::new()),
                breaker,
                live: AtomicUsize::new(0),
                waiters: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                last_comm: Mutex::new(None),
                last_error: Mutex::new(None),
                outcomes: Mutex::new(VecDeque::new()),
                registered_at: Instant::now(),
                device,
            }),
        );
        Ok(())
    }

    /// Closes a device's connections and removes its bucket. Idempotent.
    pub async fn deregister_device(&self, device_id: &str) {
        let bucket = self.shared.buckets.lock().remove(device_id);
        if let Some(bucket) = bucket {
            bucket.closed.store(true, Ordering::Release);
            close_idle(&self.shared, &bucket, "deregistered").await;
        }
        self.shared.record_pool_size();
    }

    /// The circuit breaker guarding a registered device.
    pub fn breaker(&self, device_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.shared
            .buckets
            .lock()
            .get(device_id)
            .map(|b| Arc::clone(&b.breaker))
    }

    /// Acquires a lease for one operation against `device_id`.
    ///
    /// Waits FIFO behind earlier acquirers of the same device. The wait is
    /// bounded by `connect_timeout` and the context deadline, whichever is
    /// sooner.
    pub async fn get(&self, ctx: &OpContext, device_id: &str) -> Result<Lease, GatewayError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Shutdown);
        }
        let bucket = self
            .shared
            .buckets
            .lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::UnsupportedConfig(format!("device {device_id:?} is not registered"))
            })?;

        let budget = match ctx.remaining() {
            Some(remaining) => remaining.min(self.shared.config.connect_timeout),
            None => self.shared.config.connect_timeout,
        };
        bucket.waiters.fetch_add(1, Ordering::AcqRel);
        let device_permit = self
            .acquire_permit(ctx, &bucket.sem, budget, device_id)
            .await;
        bucket.waiters.fetch_sub(1, Ordering::AcqRel);
        let device_permit = device_permit?;
        let total_permit = self
            .acquire_permit(ctx, &self.shared.total_sem, budget, device_id)
            .await?;

        if bucket.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Shutdown);
        }

        // Reuse an idle connection when one is alive.
        loop {
            let candidate = bucket.idle.lock().pop_front();
            match candidate {
                Some(idle) if idle.session.is_connected() => {
                    return Ok(Lease::new(
                        Arc::clone(&self.shared),
                        Arc::clone(&bucket),
                        idle.session,
                        device_permit,
                        total_permit,
                    ));
                }
                Some(_dead) => {
                    bucket.live.fetch_sub(1, Ordering::AcqRel);
                    self.shared.emit(PoolEvent::ConnectionClosed {
                        device: device_id.to_string(),
                        timestamp: std::time::Instant::now(),
                        reason: "dead_on_lease",
                    });
                }
                None => break,
            }
        }

        // Open a new transport. Failure accounting happens in the caller's
        // resilience manager, which shares this device's breaker; guarding
        // the connect here as well would double-count every failure and eat
        // the breaker's half-open probe slot from inside the guarded call.
        let connect = tokio::time::timeout(budget, bucket.handler.connect(&bucket.device));
        match ctx.run(async { connect.await.map_err(|_| GatewayError::Timeout) }).await {
            Ok(Ok(session)) => {
                bucket.live.fetch_add(1, Ordering::AcqRel);
                bucket.record_outcome(true);
                self.shared.emit(PoolEvent::ConnectionOpened {
                    device: device_id.to_string(),
                    timestamp: std::time::Instant::now(),
                });
                metrics::counter!(
                    "fieldgate_pool_connects_total",
                    "device" => device_id.to_string(),
                )
                .increment(1);
                self.shared.record_pool_size();
                Ok(Lease::new(
                    Arc::clone(&self.shared),
                    Arc::clone(&bucket),
                    session,
                    device_permit,
                    total_permit,
                ))
            }
            Ok(Err(err)) | Err(err) => {
                if !err.is_cancellation() {
                    bucket.record_outcome(false);
                    *bucket.last_error.lock() = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Health snapshot for one registered device.
    pub fn health_snapshot(&self, device_id: &str) -> Option<HealthSnapshot> {
        let bucket = self.shared.buckets.lock().get(device_id).cloned()?;
        let error_rate = bucket.error_rate();
        let state = match bucket.breaker.state() {
            CircuitState::Open => HealthState::Unhealthy,
            CircuitState::HalfOpen => HealthState::Degraded,
            CircuitState::Closed if error_rate > 0.5 => HealthState::Degraded,
            CircuitState::Closed => HealthState::Healthy,
        };
        let snapshot = HealthSnapshot {
            state,
            last_comm: *bucket.last_comm.lock(),
            error_rate,
            uptime: bucket.registered_at.elapsed(),
            last_error: bucket.last_error.lock().as_ref().map(|e| e.code().to_string()),
        };
        Some(snapshot)
    }

    /// Connection accounting snapshot for one registered device.
    pub fn pool_stats(&self, device_id: &str) -> Option<PoolStats> {
        let bucket = self.shared.buckets.lock().get(device_id).cloned()?;
        let live = bucket.live.load(Ordering::Relaxed);
        let idle = bucket.idle.lock().len();
        Some(PoolStats {
            live,
            idle,
            in_use: live.saturating_sub(idle),
            waiters: bucket.waiters.load(Ordering::Relaxed),
        })
    }

    /// Live connection count for a device (idle + leased).
    pub fn live_connections(&self, device_id: &str) -> usize {
        self.shared
            .buckets
            .lock()
            .get(device_id)
            .map(|b| b.live.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Stops the health task and closes every connection. Acquisitions made
    /// after this fail with `Shutdown`.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let buckets: Vec<Arc<Bucket>> = self.shared.buckets.lock().values().cloned().collect();
        for bucket in buckets {
            bucket.closed.store(true, Ordering::Release);
            close_idle(&self.shared, &bucket, "pool_closed").await;
        }
        self.shared.record_pool_size();
        tracing::info!("connection pool closed");
    }

    async fn acquire_permit(
        &self,
        ctx: &OpContext,
        sem: &Arc<Semaphore>,
        budget: Duration,
        device_id: &str,
    ) -> Result<OwnedSemaphorePermit, GatewayError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(GatewayError::Cancelled),
            acquired = tokio::time::timeout(budget, Arc::clone(sem).acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_closed)) => Err(GatewayError::Shutdown),
                    Err(_elapsed) => {
                        metrics::counter!(
                            "fieldgate_pool_exhausted_total",
                            "device" => device_id.to_string(),
                        )
                        .increment(1);
                        self.shared.emit(PoolEvent::Exhausted {
                            device: device_id.to_string(),
                            timestamp: std::time::Instant::now(),
                        });
                        Err(GatewayError::PoolExhausted(device_id.to_string()))
                    }
                }
            }
        }
    }
}

async fn close_idle(shared: &Arc<PoolShared>, bucket: &Arc<Bucket>, reason: &'static str) {
    loop {
        let conn = bucket.idle.lock().pop_front();
        let Some(mut conn) = conn else { break };
        let _ = conn.session.disconnect().await;
        bucket.live.fetch_sub(1, Ordering::AcqRel);
        shared.emit(PoolEvent::ConnectionClosed {
            device: bucket.device.id.clone(),
            timestamp: std::time::Instant::now(),
            reason,
        });
    }
}

/// Periodic maintenance: idle eviction, liveness probes, breaker-guarded
/// reconnects.
async fn health_loop(shared: Arc<PoolShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let buckets: Vec<Arc<Bucket>> = shared.buckets.lock().values().cloned().collect();
        for bucket in buckets {
            if bucket.closed.load(Ordering::Acquire) {
                continue;
            }
            // Probe under a lease slot so live connections never exceed the
            // per-device cap while a connection is out for probing.
            let Ok(slot) = Arc::clone(&bucket.sem).try_acquire_owned() else {
                continue;
            };

            let snapshot_len = bucket.idle.lock().len();
            for _ in 0..snapshot_len {
                let conn = bucket.idle.lock().pop_front();
                let Some(mut conn) = conn else { break };

                if conn.last_used.elapsed() >= shared.config.idle_timeout {
                    let _ = conn.session.disconnect().await;
                    bucket.live.fetch_sub(1, Ordering::AcqRel);
                    shared.emit(PoolEvent::IdleEvicted {
                        device: bucket.device.id.clone(),
                        timestamp: std::time::Instant::now(),
                    });
                    tracing::debug!(device = %bucket.device.id, "idle connection evicted");
                    continue;
                }

                match conn.session.ping().await {
                    Ok(()) => {
                        bucket.record_outcome(true);
                        bucket.idle.lock().push_back(conn);
                    }
                    Err(err) => {
                        bucket.live.fetch_sub(1, Ordering::AcqRel);
                        bucket.record_outcome(false);
                        *bucket.last_error.lock() = Some(err.clone());
                        shared.emit(PoolEvent::ProbeFailed {
                            device: bucket.device.id.clone(),
                            timestamp: std::time::Instant::now(),
                        });
                        tracing::warn!(
                            device = %bucket.device.id,
                            error = %err,
                            "health probe failed, attempting reconnect"
                        );
                        reconnect(&shared, &bucket).await;
                    }
                }
            }
            drop(slot);
        }
        shared.record_pool_size();
    }
}

/// One breaker-guarded reconnect attempt after a failed probe.
async fn reconnect(shared: &Arc<PoolShared>, bucket: &Arc<Bucket>) {
    let Ok(permit) = bucket.breaker.try_acquire() else {
        return;
    };
    let connect = tokio::time::timeout(
        shared.config.connect_timeout,
        bucket.handler.connect(&bucket.device),
    );
    match connect.await {
        Ok(Ok(session)) => {
            permit.success();
            bucket.live.fetch_add(1, Ordering::AcqRel);
            bucket.record_outcome(true);
            bucket.idle.lock().push_back(IdleConn {
                session,
                last_used: Instant::now(),
            });
            shared.emit(PoolEvent::ConnectionOpened {
                device: bucket.device.id.clone(),
                timestamp: std::time::Instant::now(),
            });
        }
        Ok(Err(err)) => {
            permit.failure();
            bucket.record_outcome(false);
            *bucket.last_error.lock() = Some(err);
        }
        Err(_elapsed) => {
            permit.failure();
            bucket.record_outcome(false);
            *bucket.last_error.lock() = Some(GatewayError::Timeout);
        }
    }
}
