//! The batch scheduler: grouping, flush triggers, dispatch.

use crate::adaptive::AdaptiveController;
use crate::config::SchedulerConfig;
use crate::events::SchedulerEvent;
use crate::request::{
    BatchOp, BatchRequest, BatchResult, CompletionReceiver, CompletionSink, OpKind,
};
use fieldgate_core::{DataType, DeviceId, GatewayError, OpContext, Tag, TagId, Value};
use fieldgate_pool::ConnectionPool;
use fieldgate_resilience::{CircuitBreakerConfig, ResilienceManager, RetryPolicy};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Requests share a batch iff they share this key. The adjacency `class` is
/// the handler's opaque token; `solo` is nonzero for `can_batch = false`
/// requests, pinning each into a group of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    kind: OpKind,
    data_type: DataType,
    class: u64,
    solo: u64,
}

struct Pending {
    request: BatchRequest,
    sink: CompletionSink,
    enqueued_at: Instant,
}

#[derive(Default)]
struct Group {
    pending: Vec<Pending>,
}

struct DeviceQueue {
    groups: HashMap<GroupKey, Group>,
    controller: AdaptiveController,
    solo_seq: u64,
}

struct SchedState {
    devices: HashMap<DeviceId, DeviceQueue>,
    /// Tags with a dispatched-but-uncompleted WRITE; reads and further
    /// writes to these tags stay queued.
    inflight_writes: HashSet<(DeviceId, TagId)>,
    last_global_flush: Instant,
}

struct SchedShared {
    config: SchedulerConfig,
    pool: Arc<ConnectionPool>,
    state: Mutex<SchedState>,
    notify: Notify,
    cancel: CancellationToken,
    managers: Mutex<HashMap<DeviceId, ResilienceManager>>,
    closed: AtomicBool,
}

struct Dispatch {
    device_id: DeviceId,
    kind: OpKind,
    pending: Vec<Pending>,
}

/// Coalesces tag operations per device and dispatches them through pooled
/// leases inside the per-device resilience manager.
///
/// A group flushes when any of these hold: it reached the device's current
/// adaptive batch size; its oldest request aged past `batch_timeout`; it
/// holds a request with priority above the threshold; a request's deadline
/// is within `batch_timeout`; or the global flush tick fired.
pub struct BatchScheduler {
    shared: Arc<SchedShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    /// Creates the scheduler and spawns its dispatch worker.
    pub fn new(config: SchedulerConfig, pool: Arc<ConnectionPool>) -> Self {
        let shared = Arc::new(SchedShared {
            config,
            pool,
            state: Mutex::new(SchedState {
                devices: HashMap::new(),
                inflight_writes: HashSet::new(),
                last_global_flush: Instant::now(),
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            managers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = tokio::spawn(worker_loop(worker_shared));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Submits one operation. The returned receiver resolves exactly once.
    ///
    /// A request whose deadline has already passed completes with `Timeout`
    /// without reaching any handler; after shutdown everything completes
    /// with `Shutdown`.
    pub fn submit(&self, request: BatchRequest) -> CompletionReceiver {
        let (sink, rx) = CompletionSink::channel();
        if self.shared.closed.load(Ordering::Acquire) {
            sink.complete(Err(GatewayError::Shutdown));
            return rx;
        }
        let now = Instant::now();
        if request.deadline.is_some_and(|d| d <= now) {
            sink.complete(Err(GatewayError::Timeout));
            return rx;
        }

        let priority = request.priority;
        let near_deadline = request
            .deadline
            .is_some_and(|d| d <= now + self.shared.config.batch_timeout);

        let wake = {
            let mut state = self.shared.state.lock();
            let queue = state
                .devices
                .entry(request.device_id.clone())
                .or_insert_with(|| DeviceQueue {
                    groups: HashMap::new(),
                    controller: AdaptiveController::new(self.shared.config.adaptive.clone()),
                    solo_seq: 0,
                });
            let solo = if request.can_batch {
                0
            } else {
                queue.solo_seq += 1;
                queue.solo_seq
            };
            let key = GroupKey {
                kind: request.op.kind(),
                data_type: request.data_type(),
                class: request.batch_class,
                solo,
            };
            let current = queue.controller.current();
            let group = queue.groups.entry(key).or_default();
            group.pending.push(Pending {
                request,
                sink,
                enqueued_at: now,
            });
            // A brand-new group wakes the worker so its batch-timeout edge
            // enters the worker's sleep computation.
            group.pending.len() == 1
                || group.pending.len() >= current
                || priority > self.shared.config.high_priority_threshold
                || near_deadline
        };

        metrics::counter!("fieldgate_scheduler_requests_total").increment(1);
        if wake {
            self.shared.notify.notify_one();
        }
        rx
    }

    /// Cancels a queued request; it completes with `Cancelled` and is never
    /// dispatched. Returns `false` when the request is unknown or already
    /// dispatched.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.shared.state.lock();
        for (device_id, queue) in state.devices.iter_mut() {
            for group in queue.groups.values_mut() {
                if let Some(pos) = group.pending.iter().position(|p| p.request.id == id) {
                    let pending = group.pending.remove(pos);
                    pending.sink.complete(Err(GatewayError::Cancelled));
                    self.shared.config.listeners.emit(&SchedulerEvent::RequestCancelled {
                        device: device_id.clone(),
                        timestamp: std::time::Instant::now(),
                    });
                    return true;
                }
            }
        }
        false
    }

    /// Cancels everything queued for a device (used when the device is
    /// deregistered). Returns how many requests were cancelled.
    pub fn cancel_device(&self, device_id: &str) -> usize {
        let mut state = self.shared.state.lock();
        let Some(queue) = state.devices.get_mut(device_id) else {
            return 0;
        };
        let mut cancelled = 0;
        for group in queue.groups.values_mut() {
            for pending in group.pending.drain(..) {
                pending.sink.complete(Err(GatewayError::Cancelled));
                cancelled += 1;
            }
        }
        queue.groups.clear();
        self.shared.managers.lock().remove(device_id);
        cancelled
    }

    /// The device's current adaptive batch size, if it has a queue.
    pub fn current_batch_size(&self, device_id: &str) -> Option<usize> {
        self.shared
            .state
            .lock()
            .devices
            .get(device_id)
            .map(|q| q.controller.current())
    }

    /// Quiesces the scheduler: no new dispatches, queued requests complete
    /// with `Shutdown`, in-flight batches get up to `timeout` to finish and
    /// are aborted after that (their sinks still fire).
    pub async fn shutdown(&self, timeout: Duration) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(mut handle) = worker {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        tracing::info!("batch scheduler stopped");
    }
}

async fn worker_loop(shared: Arc<SchedShared>) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    loop {
        let (dispatches, next_wake) = collect_ready(&shared);
        for dispatch in dispatches {
            let task_shared = Arc::clone(&shared);
            tasks.spawn(run_dispatch(task_shared, dispatch));
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.notify.notified() => {}
            _ = sleep_until_opt(next_wake) => {}
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // Quiesce: everything still queued completes with Shutdown.
    {
        let mut state = shared.state.lock();
        for queue in state.devices.values_mut() {
            for group in queue.groups.values_mut() {
                for pending in group.pending.drain(..) {
                    pending.sink.complete(Err(GatewayError::Shutdown));
                }
            }
            queue.groups.clear();
        }
        state.inflight_writes.clear();
    }
    while tasks.join_next().await.is_some() {}
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Evaluates flush triggers, expires overdue requests, and extracts
/// dispatchable batches. Returns the batches plus the next time-based
/// trigger to sleep toward.
fn collect_ready(shared: &Arc<SchedShared>) -> (Vec<Dispatch>, Option<Instant>) {
    let config = &shared.config;
    let mut state = shared.state.lock();
    let now = Instant::now();

    let global_flush = now.duration_since(state.last_global_flush) >= config.flush_interval;
    if global_flush {
        state.last_global_flush = now;
    }
    let mut next_wake = Some(state.last_global_flush + config.flush_interval);

    let SchedState {
        devices,
        inflight_writes,
        ..
    } = &mut *state;

    let mut dispatches = Vec::new();
    for (device_id, queue) in devices.iter_mut() {
        // Overdue requests complete with Timeout, well inside the
        // deadline-plus-grace completion bound.
        for group in queue.groups.values_mut() {
            let mut kept = Vec::with_capacity(group.pending.len());
            for pending in group.pending.drain(..) {
                if pending.request.deadline.is_some_and(|d| d <= now) {
                    pending.sink.complete(Err(GatewayError::Timeout));
                    config.listeners.emit(&SchedulerEvent::RequestExpired {
                        device: device_id.clone(),
                        timestamp: std::time::Instant::now(),
                    });
                    metrics::counter!(
                        "fieldgate_scheduler_expired_total",
                        "device" => device_id.clone(),
                    )
                    .increment(1);
                } else {
                    kept.push(pending);
                }
            }
            group.pending = kept;
        }
        queue.groups.retain(|_, group| !group.pending.is_empty());

        let current = queue.controller.current();
        let keys: Vec<GroupKey> = queue.groups.keys().copied().collect();

        // Writes dispatch ahead of reads for the same device.
        let mut ordered: Vec<GroupKey> = Vec::with_capacity(keys.len());
        ordered.extend(keys.iter().filter(|k| k.kind == OpKind::Write).copied());
        ordered.extend(keys.iter().filter(|k| k.kind == OpKind::Read).copied());

        // Tags with writes still queued; reads to them hold back so a read
        // submitted after a write observes the written value.
        let mut queued_write_tags: HashSet<TagId> = HashSet::new();
        for key in &keys {
            if key.kind == OpKind::Write {
                if let Some(group) = queue.groups.get(key) {
                    queued_write_tags.extend(group.pending.iter().map(|p| p.request.tag.id.clone()));
                }
            }
        }

        for key in ordered {
            let Some(group) = queue.groups.get_mut(&key) else {
                continue;
            };

            let oldest = group.pending.iter().map(|p| p.enqueued_at).min();
            let min_deadline = group.pending.iter().filter_map(|p| p.request.deadline).min();
            let ready = global_flush
                || group.pending.len() >= current
                || oldest.is_some_and(|t| now.duration_since(t) >= config.batch_timeout)
                || group
                    .pending
                    .iter()
                    .any(|p| p.request.priority > config.high_priority_threshold)
                || min_deadline.is_some_and(|d| d <= now + config.batch_timeout);

            if !ready {
                if let Some(oldest) = oldest {
                    merge_wake(&mut next_wake, oldest + config.batch_timeout);
                }
                if let Some(deadline) = min_deadline {
                    merge_wake(&mut next_wake, deadline.max(now));
                }
                continue;
            }

            let mut selected = Vec::new();
            let mut kept = Vec::new();
            let mut batch_addresses: HashSet<String> = HashSet::new();
            for pending in std::mem::take(&mut group.pending) {
                let tag_key = (device_id.clone(), pending.request.tag.id.clone());
                let eligible = selected.len() < current
                    && match key.kind {
                        // One write per address per batch, and never while a
                        // write to the same tag is still in flight.
                        OpKind::Write => {
                            !inflight_writes.contains(&tag_key)
                                && batch_addresses.insert(pending.request.tag.address.clone())
                        }
                        OpKind::Read => {
                            !queued_write_tags.contains(&pending.request.tag.id)
                                && !inflight_writes.contains(&tag_key)
                        }
                    };
                if eligible {
                    if key.kind == OpKind::Write {
                        inflight_writes.insert(tag_key);
                    }
                    selected.push(pending);
                } else {
                    kept.push(pending);
                }
            }
            group.pending = kept;

            if selected.is_empty() {
                continue;
            }
            // Higher priority sits at the head of the batch.
            selected.sort_by(|a, b| b.request.priority.cmp(&a.request.priority));
            dispatches.push(Dispatch {
                device_id: device_id.clone(),
                kind: key.kind,
                pending: selected,
            });
        }
        queue.groups.retain(|_, group| !group.pending.is_empty());
    }

    (dispatches, next_wake)
}

fn merge_wake(next: &mut Option<Instant>, candidate: Instant) {
    *next = Some(match *next {
        Some(current) => current.min(candidate),
        None => candidate,
    });
}

fn manager_for(shared: &Arc<SchedShared>, device_id: &DeviceId) -> ResilienceManager {
    let mut managers = shared.managers.lock();
    managers
        .entry(device_id.clone())
        .or_insert_with(|| {
            let retry = RetryPolicy::builder()
                .max_retries(shared.config.max_retries)
                .exponential_backoff(
                    shared.config.retry_initial_delay,
                    shared.config.retry_max_delay,
                )
                .jitter(shared.config.retry_jitter)
                .name(format!("dispatch:{device_id}"))
                .build();
            let breaker = shared.pool.breaker(device_id).unwrap_or_else(|| {
                CircuitBreakerConfig::builder()
                    .name(device_id.clone())
                    .build()
                    .into_breaker()
            });
            ResilienceManager::new(device_id.clone(), retry, breaker)
        })
        .clone()
}

async fn run_dispatch(shared: Arc<SchedShared>, dispatch: Dispatch) {
    let device_id = dispatch.device_id.clone();
    let size = dispatch.pending.len();
    shared.config.listeners.emit(&SchedulerEvent::BatchDispatched {
        device: device_id.clone(),
        timestamp: std::time::Instant::now(),
        size,
    });
    metrics::counter!(
        "fieldgate_scheduler_batches_total",
        "device" => device_id.clone(),
    )
    .increment(1);
    metrics::histogram!("fieldgate_scheduler_batch_size").record(size as f64);
    metrics::gauge!("fieldgate_scheduler_inflight_batches").increment(1.0);

    // Every dispatch is guarded by the earliest request deadline plus grace.
    let base = dispatch
        .pending
        .iter()
        .filter_map(|p| p.request.deadline)
        .min()
        .unwrap_or_else(|| Instant::now() + shared.config.default_op_timeout);
    let ctx = OpContext::background().with_deadline(base + shared.config.grace);
    let manager = manager_for(&shared, &device_id);

    let started = Instant::now();
    let (ok_count, write_tags) = match dispatch.kind {
        OpKind::Read => {
            let mut tags: Vec<Tag> = Vec::new();
            for pending in &dispatch.pending {
                if !tags.iter().any(|t| t.id == pending.request.tag.id) {
                    tags.push(pending.request.tag.clone());
                }
            }

            let pool = Arc::clone(&shared.pool);
            let result = manager
                .execute(&ctx, |_attempt| {
                    let tags = tags.clone();
                    let pool = Arc::clone(&pool);
                    let device_id = device_id.clone();
                    let ctx = ctx.clone();
                    async move {
                        let mut lease = pool.get(&ctx, &device_id).await?;
                        let outcome = lease.session().read_multiple(&tags).await;
                        match &outcome {
                            Ok(_) => lease.report_success(),
                            Err(err) => lease.report_failure(err),
                        }
                        outcome
                    }
                })
                .await;

            let latency = started.elapsed();
            let mut ok = 0;
            match result {
                Ok(outcome) => {
                    for pending in dispatch.pending {
                        match outcome.get(&pending.request.tag.id) {
                            Some(Ok(value)) => {
                                ok += 1;
                                pending.sink.complete(Ok(BatchResult {
                                    value: Some(value.clone()),
                                    latency,
                                }));
                            }
                            Some(Err(err)) => pending.sink.complete(Err(err.clone())),
                            None => {
                                tracing::warn!(
                                    device = %device_id,
                                    tag = %pending.request.tag.id,
                                    "handler omitted a per-tag result"
                                );
                                pending.sink.complete(Err(GatewayError::Transport(
                                    "missing per-tag result".into(),
                                )));
                            }
                        }
                    }
                }
                Err(err) => {
                    for pending in dispatch.pending {
                        pending.sink.complete(Err(err.clone()));
                    }
                }
            }
            (ok, Vec::new())
        }
        OpKind::Write => {
            let writes: Vec<(Tag, Value)> = dispatch
                .pending
                .iter()
                .filter_map(|p| match &p.request.op {
                    BatchOp::Write(value) => Some((p.request.tag.clone(), value.clone())),
                    BatchOp::Read => None,
                })
                .collect();
            let write_tags: Vec<TagId> = dispatch
                .pending
                .iter()
                .map(|p| p.request.tag.id.clone())
                .collect();

            let pool = Arc::clone(&shared.pool);
            let result = manager
                .execute(&ctx, |_attempt| {
                    let writes = writes.clone();
                    let pool = Arc::clone(&pool);
                    let device_id = device_id.clone();
                    let ctx = ctx.clone();
                    async move {
                        let mut lease = pool.get(&ctx, &device_id).await?;
                        let outcome = lease.session().write_multiple(&writes).await;
                        match &outcome {
                            Ok(_) => lease.report_success(),
                            Err(err) => lease.report_failure(err),
                        }
                        outcome
                    }
                })
                .await;

            let latency = started.elapsed();
            let mut ok = 0;
            match result {
                Ok(outcome) => {
                    for pending in dispatch.pending {
                        match outcome.get(&pending.request.tag.id) {
                            Some(Ok(())) => {
                                ok += 1;
                                pending.sink.complete(Ok(BatchResult {
                                    value: None,
                                    latency,
                                }));
                            }
                            Some(Err(err)) => pending.sink.complete(Err(err.clone())),
                            None => pending.sink.complete(Err(GatewayError::Transport(
                                "missing per-tag result".into(),
                            ))),
                        }
                    }
                }
                Err(err) => {
                    for pending in dispatch.pending {
                        pending.sink.complete(Err(err.clone()));
                    }
                }
            }
            (ok, write_tags)
        }
    };

    let latency = started.elapsed();
    metrics::histogram!(
        "fieldgate_scheduler_dispatch_seconds",
        "device" => device_id.clone(),
    )
    .record(latency.as_secs_f64());
    metrics::gauge!("fieldgate_scheduler_inflight_batches").decrement(1.0);

    // Release write claims, feed the adaptive controller, and wake the
    // worker so held-back requests get another look.
    let mut state = shared.state.lock();
    for tag in write_tags {
        state.inflight_writes.remove(&(device_id.clone(), tag));
    }
    if let Some(queue) = state.devices.get_mut(&device_id) {
        if let Some((old, new)) = queue.controller.record_batch(latency, ok_count, size) {
            // Both sides of the adjustment are recorded so regression tests
            // can follow the controller's trajectory.
            metrics::gauge!(
                "fieldgate_scheduler_batch_size_limit",
                "device" => device_id.clone(),
                "stage" => "pre",
            )
            .set(old as f64);
            metrics::gauge!(
                "fieldgate_scheduler_batch_size_limit",
                "device" => device_id.clone(),
                "stage" => "post",
            )
            .set(new as f64);
            tracing::info!(device = %device_id, old, new, "batch size adjusted");
            shared.config.listeners.emit(&SchedulerEvent::BatchSizeAdjusted {
                device: device_id.clone(),
                timestamp: std::time::Instant::now(),
                old,
                new,
            });
        }
    }
    drop(state);
    shared.notify.notify_one();
}
