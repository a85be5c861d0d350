//! The gateway facade: registry, request routing, polling, lifecycle.

use crate::cache::TagCache;
use crate::config::GatewayConfig;
use crate::subscription::{Subscription, SubscriptionFilter, SubscriptionHub, TagUpdate};
use fieldgate_core::{
    Device, DeviceId, GatewayError, HealthSnapshot, OpContext, Protocol, Quality, Tag, TagId,
    TagValue, Value,
};
use fieldgate_egress::{CloudSample, EgressPipeline};
use fieldgate_pool::{ConnectionPool, PoolConfig};
use fieldgate_protocol::{DiscoveryRange, HandlerRegistry, ProtocolHandler};
use fieldgate_resilience::CircuitState;
use fieldgate_scheduler::{BatchRequest, BatchResult, BatchScheduler, SchedulerConfig};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
struct DeviceEntry {
    device: Device,
    tags: HashMap<TagId, Tag>,
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct GatewayInner {
    config: GatewayConfig,
    registry: HandlerRegistry,
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    pool: Arc<ConnectionPool>,
    scheduler: BatchScheduler,
    cache: TagCache,
    hub: SubscriptionHub,
    egress: Option<EgressPipeline>,
    cancel: CancellationToken,
    housekeeping: Mutex<Vec<JoinHandle<()>>>,
    poll_tasks: Mutex<HashMap<DeviceId, PollTask>>,
    stopped: AtomicBool,
}

/// Builder assembling the gateway's component registry.
pub struct GatewayBuilder {
    config: GatewayConfig,
    pool_config: PoolConfig,
    scheduler_config: SchedulerConfig,
    registry: HandlerRegistry,
    egress: Option<EgressPipeline>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            pool_config: PoolConfig::default(),
            scheduler_config: SchedulerConfig::default(),
            registry: HandlerRegistry::new(),
            egress: None,
        }
    }

    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Registers a protocol handler. Registration is explicit and happens
    /// before start; there is no runtime handler discovery.
    pub fn handler(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.registry.register(handler);
        self
    }

    /// Attaches a cloud egress pipeline; samples from successful reads are
    /// enqueued into it.
    pub fn egress(mut self, egress: EgressPipeline) -> Self {
        self.egress = Some(egress);
        self
    }

    /// Starts the gateway: pool, scheduler, and housekeeping tasks come up
    /// here, in dependency order.
    pub fn start(self) -> Gateway {
        let pool = Arc::new(ConnectionPool::new(self.pool_config, self.registry.clone()));
        let scheduler = BatchScheduler::new(self.scheduler_config, Arc::clone(&pool));
        let cache = TagCache::new(
            self.config.tag_ttl,
            self.config.error_window,
            self.config.error_threshold,
        );
        let hub = SubscriptionHub::new(self.config.subscription_buffer);

        let inner = Arc::new(GatewayInner {
            registry: self.registry,
            devices: RwLock::new(HashMap::new()),
            pool,
            scheduler,
            cache,
            hub,
            egress: self.egress,
            cancel: CancellationToken::new(),
            housekeeping: Mutex::new(Vec::new()),
            poll_tasks: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            config: self.config,
        });

        let sweeper_inner = Arc::clone(&inner);
        let sweeper = tokio::spawn(stale_sweeper(sweeper_inner));
        inner.housekeeping.lock().push(sweeper);

        tracing::info!("gateway started");
        Gateway { inner }
    }
}

/// The gateway core: device registry, tag-value cache, subscription
/// fan-out, and the request router over scheduler, pool, and handlers.
///
/// Cheap to clone; clones share the same runtime.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Registers a device. Its protocol must have a registered handler. A
    /// device with an `update_interval` gets a polling task.
    pub fn register_device(&self, device: Device) -> Result<(), GatewayError> {
        self.ensure_running()?;
        // Fails fast when no handler serves this protocol.
        self.inner.registry.get(device.protocol)?;
        self.inner.pool.register_device(device.clone())?;

        let device_id = device.id.clone();
        let update_interval = device.update_interval;
        self.inner.devices.write().insert(
            device_id.clone(),
            DeviceEntry {
                device,
                tags: HashMap::new(),
            },
        );

        if let Some(interval) = update_interval {
            let interval = interval.max(Duration::from_millis(1));
            let cancel = self.inner.cancel.child_token();
            let poll_inner = Arc::clone(&self.inner);
            let poll_cancel = cancel.clone();
            let poll_device = device_id.clone();
            let handle = tokio::spawn(async move {
                poll_loop(poll_inner, poll_device, interval, poll_cancel).await;
            });
            self.inner
                .poll_tasks
                .lock()
                .insert(device_id, PollTask { cancel, handle });
        }
        Ok(())
    }

    /// Deregisters a device: stops polling, cancels queued work, closes its
    /// connections, and drops its cache entries. Idempotent.
    pub async fn deregister_device(&self, device_id: &str) {
        let poll = self.inner.poll_tasks.lock().remove(device_id);
        if let Some(poll) = poll {
            poll.cancel.cancel();
            let _ = poll.handle.await;
        }
        let cancelled = self.inner.scheduler.cancel_device(device_id);
        if cancelled > 0 {
            tracing::debug!(device = device_id, cancelled, "queued requests cancelled");
        }
        self.inner.pool.deregister_device(device_id).await;
        self.inner.cache.remove_device(device_id);
        self.inner.devices.write().remove(device_id);
    }

    /// Admits a tag after the handler accepts its address and data type.
    pub fn add_tag(&self, device_id: &str, tag: Tag) -> Result<(), GatewayError> {
        self.ensure_running()?;
        let mut devices = self.inner.devices.write();
        let entry = devices.get_mut(device_id).ok_or_else(|| {
            GatewayError::UnsupportedConfig(format!("device {device_id:?} is not registered"))
        })?;
        let handler = self.inner.registry.get(entry.device.protocol)?;
        handler.validate_address(&tag.address)?;
        if !handler.supported_data_types().contains(&tag.data_type) {
            return Err(GatewayError::UnsupportedConfig(format!(
                "{} does not support {}",
                entry.device.protocol, tag.data_type
            )));
        }
        entry.tags.insert(tag.id.clone(), tag);
        Ok(())
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.inner
            .devices
            .read()
            .values()
            .map(|e| e.device.clone())
            .collect()
    }

    pub fn list_tags(&self, device_id: &str) -> Vec<Tag> {
        self.inner
            .devices
            .read()
            .get(device_id)
            .map(|e| e.tags.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tags of a device sharing one poll group.
    pub fn tags_in_poll_group(&self, device_id: &str, poll_group: &str) -> Vec<Tag> {
        self.inner
            .devices
            .read()
            .get(device_id)
            .map(|e| {
                e.tags
                    .values()
                    .filter(|t| t.poll_group.as_deref() == Some(poll_group))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Probes an address range through the protocol's handler. Candidates
    /// are returned unregistered.
    pub async fn discover(
        &self,
        protocol: Protocol,
        range: &DiscoveryRange,
    ) -> Result<Vec<Device>, GatewayError> {
        self.ensure_running()?;
        let handler = self.inner.registry.get(protocol)?;
        handler.discover(range).await
    }

    /// Reads a set of tags. Device-level failures are the outer error;
    /// per-tag outcomes are inside the map.
    pub async fn read_tags(
        &self,
        ctx: &OpContext,
        device_id: &str,
        tag_ids: &[TagId],
    ) -> Result<HashMap<TagId, Result<TagValue, GatewayError>>, GatewayError> {
        self.ensure_running()?;
        ctx.check()?;
        let entry = self.lookup(device_id)?;
        let handler = self.inner.registry.get(entry.device.protocol)?;
        let deadline = self.effective_deadline(ctx);

        let mut results: HashMap<TagId, Result<TagValue, GatewayError>> = HashMap::new();
        let mut submitted: Vec<(TagId, Uuid, fieldgate_scheduler::CompletionReceiver)> =
            Vec::new();
        for tag_id in tag_ids {
            match entry.tags.get(tag_id) {
                Some(tag) => {
                    let class = handler.batch_class(&tag.address);
                    let request = BatchRequest::read(device_id, tag.clone(), class)
                        .with_deadline(deadline);
                    let id = request.id;
                    submitted.push((tag_id.clone(), id, self.inner.scheduler.submit(request)));
                }
                None => {
                    results.insert(
                        tag_id.clone(),
                        Err(GatewayError::InvalidAddress {
                            address: tag_id.clone(),
                            reason: "unknown tag".into(),
                        }),
                    );
                }
            }
        }

        for (tag_id, request_id, rx) in submitted {
            let completion = tokio::select! {
                _ = ctx.cancelled() => {
                    self.inner.scheduler.cancel(request_id);
                    Err(GatewayError::Cancelled)
                }
                received = rx => received.unwrap_or(Err(GatewayError::Shutdown)),
            };
            let outcome = self
                .inner
                .apply_read_completion(device_id, &tag_id, completion);
            results.insert(tag_id, outcome);
        }
        Ok(results)
    }

    /// Writes one tag after type and writability checks. Never coalesced
    /// with other writes to the same address.
    pub async fn write_tag(
        &self,
        ctx: &OpContext,
        device_id: &str,
        tag_id: &str,
        value: Value,
    ) -> Result<(), GatewayError> {
        self.ensure_running()?;
        ctx.check()?;
        let entry = self.lookup(device_id)?;
        let tag = entry
            .tags
            .get(tag_id)
            .ok_or_else(|| GatewayError::InvalidAddress {
                address: tag_id.to_string(),
                reason: "unknown tag".into(),
            })?
            .clone();
        if !tag.writable {
            return Err(GatewayError::NotWritable);
        }
        if !value.matches(tag.data_type) {
            return Err(GatewayError::TypeMismatch {
                expected: tag.data_type,
                actual: value.data_type(),
            });
        }

        let handler = self.inner.registry.get(entry.device.protocol)?;
        let class = handler.batch_class(&tag.address);
        let request = BatchRequest::write(device_id, tag, value, class)
            .with_deadline(self.effective_deadline(ctx));
        let request_id = request.id;
        let rx = self.inner.scheduler.submit(request);

        let completion = tokio::select! {
            _ = ctx.cancelled() => {
                self.inner.scheduler.cancel(request_id);
                Err(GatewayError::Cancelled)
            }
            received = rx => received.unwrap_or(Err(GatewayError::Shutdown)),
        };
        completion.map(|_ack| ())
    }

    /// The cached last observation for a tag, if any.
    pub fn cached_value(&self, device_id: &str, tag_id: &str) -> Option<TagValue> {
        self.inner.cache.get(device_id, tag_id)
    }

    /// Registers a subscriber; updates matching the filter are delivered
    /// through a bounded latest-wins queue.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.inner.hub.subscribe(filter)
    }

    /// Removes a subscription by id; idempotent.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.inner.hub.unsubscribe(id)
    }

    /// Health snapshot for a registered device.
    pub fn health(&self, device_id: &str) -> Option<HealthSnapshot> {
        self.inner.pool.health_snapshot(device_id)
    }

    /// Health snapshot for an egress connector.
    pub fn connector_health(&self, connector: &str) -> Option<HealthSnapshot> {
        self.inner.egress.as_ref().and_then(|e| e.health(connector))
    }

    /// Quiesces and tears down in reverse dependency order: polling stops,
    /// egress flushes up to the deadline, the scheduler quiesces, pools
    /// drain, and whatever remains is closed forcibly.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(?deadline, "gateway shutting down");
        let deadline_at = Instant::now() + deadline;

        let polls: Vec<PollTask> = {
            let mut tasks = self.inner.poll_tasks.lock();
            tasks.drain().map(|(_, task)| task).collect()
        };
        for poll in &polls {
            poll.cancel.cancel();
        }
        for poll in polls {
            let _ = poll.handle.await;
        }

        if let Some(egress) = &self.inner.egress {
            egress.shutdown(remaining(deadline_at)).await;
        }
        self.inner.scheduler.shutdown(remaining(deadline_at)).await;
        self.inner.pool.close().await;

        self.inner.cancel.cancel();
        let housekeeping = std::mem::take(&mut *self.inner.housekeeping.lock());
        for task in housekeeping {
            let _ = task.await;
        }
        self.inner.hub.close_all();
        tracing::info!("gateway stopped");
    }

    fn ensure_running(&self) -> Result<(), GatewayError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            Err(GatewayError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn lookup(&self, device_id: &str) -> Result<DeviceEntry, GatewayError> {
        self.inner
            .devices
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::UnsupportedConfig(format!("device {device_id:?} is not registered"))
            })
    }

    fn effective_deadline(&self, ctx: &OpContext) -> Instant {
        let fallback = Instant::now() + self.inner.config.default_deadline;
        ctx.effective_deadline(Some(fallback)).unwrap_or(fallback)
    }
}

impl GatewayInner {
    /// The single writer of the tag-value cache: completion results land
    /// here, update the cache, wake subscribers, and feed egress.
    fn apply_read_completion(
        &self,
        device_id: &str,
        tag_id: &str,
        completion: Result<BatchResult, GatewayError>,
    ) -> Result<TagValue, GatewayError> {
        match completion {
            Ok(result) => {
                let Some(value) = result.value else {
                    return Err(GatewayError::Transport(
                        "read completed without a value".into(),
                    ));
                };
                // A value fetched through a recovering circuit is flagged
                // UNCERTAIN until the breaker closes again.
                let quality = match self.pool.breaker(device_id).map(|b| b.state()) {
                    Some(CircuitState::HalfOpen) => Quality::Uncertain,
                    _ => Quality::Good,
                };
                let stored = self.cache.record_success(
                    device_id,
                    tag_id,
                    value,
                    result.latency,
                    quality,
                );
                metrics::histogram!(
                    "fieldgate_read_latency_seconds",
                    "device" => device_id.to_string(),
                )
                .record(result.latency.as_secs_f64());

                self.hub.publish(&TagUpdate {
                    device_id: device_id.to_string(),
                    tag_id: tag_id.to_string(),
                    value: stored.clone(),
                });

                if let Some(egress) = &self.egress {
                    let sample = CloudSample::new(
                        device_id,
                        tag_id,
                        stored.value.clone(),
                        stored.quality,
                    );
                    if let Err(err) = egress.enqueue(sample) {
                        tracing::debug!(
                            device = device_id,
                            tag = tag_id,
                            error = %err,
                            "sample not enqueued for egress"
                        );
                    }
                }
                Ok(stored)
            }
            Err(err) => {
                metrics::counter!(
                    "fieldgate_read_failures_total",
                    "device" => device_id.to_string(),
                    "error" => err.code(),
                )
                .increment(1);
                if let Some(degraded) = self.cache.record_error(device_id, tag_id) {
                    self.hub.publish(&TagUpdate {
                        device_id: device_id.to_string(),
                        tag_id: tag_id.to_string(),
                        value: degraded,
                    });
                }
                Err(err)
            }
        }
    }
}

fn remaining(deadline_at: Instant) -> Duration {
    deadline_at.saturating_duration_since(Instant::now())
}

/// Periodically degrades unrefreshed cache entries to STALE and notifies
/// subscribers of the change.
async fn stale_sweeper(inner: Arc<GatewayInner>) {
    let mut ticker = tokio::time::interval(inner.config.stale_sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for (device_id, tag_id, value) in inner.cache.sweep_stale() {
            inner.hub.publish(&TagUpdate {
                device_id,
                tag_id,
                value,
            });
        }
    }
}

/// Per-device polling: every tick enqueues reads for subscribed tags. The
/// tick is cooperative: a tag whose previous poll has not completed is
/// skipped instead of piling up.
async fn poll_loop(
    inner: Arc<GatewayInner>,
    device_id: DeviceId,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut inflight: HashSet<TagId> = HashSet::new();
    let mut completions: FuturesUnordered<_> = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let entry = inner.devices.read().get(&device_id).cloned();
                let Some(entry) = entry else { break };
                let Ok(handler) = inner.registry.get(entry.device.protocol) else {
                    break;
                };
                for tag in entry.tags.values() {
                    if !inner.hub.has_subscriber(&device_id, &tag.id) {
                        continue;
                    }
                    if inflight.contains(&tag.id) {
                        continue;
                    }
                    inflight.insert(tag.id.clone());
                    let class = handler.batch_class(&tag.address);
                    let request = BatchRequest::read(device_id.as_str(), tag.clone(), class)
                        .with_deadline(Instant::now() + inner.config.default_deadline);
                    let rx = inner.scheduler.submit(request);
                    let tag_id = tag.id.clone();
                    completions.push(async move { (tag_id, rx.await) });
                }
            }
            Some((tag_id, received)) = completions.next(), if !completions.is_empty() => {
                inflight.remove(&tag_id);
                let completion = received.unwrap_or(Err(GatewayError::Shutdown));
                let _ = inner.apply_read_completion(&device_id, &tag_id, completion);
            }
        }
    }

    // Let already-submitted polls resolve before the task exits.
    while let Some((tag_id, received)) = completions.next().await {
        inflight.remove(&tag_id);
        let completion = received.unwrap_or(Err(GatewayError::Shutdown));
        let _ = inner.apply_read_completion(&device_id, &tag_id, completion);
    }
}
