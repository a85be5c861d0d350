//! The delivery pipeline: per-connector buffering, flush workers, resilient
//! sends.

use crate::config::ConnectorConfig;
use crate::connector::CloudConnector;
use crate::events::EgressEvent;
use crate::routing::{RoutingRule, RoutingTable};
use crate::sample::CloudSample;
use fieldgate_buffer::{
    BufferConfig, BufferedMessage, MessageBuffer, OverflowPolicy, PersistenceConfig,
};
use fieldgate_core::events::{EventListeners, FnListener};
use fieldgate_core::{GatewayError, HealthSnapshot, HealthState, OpContext};
use fieldgate_resilience::{
    CircuitBreakerConfig, CircuitState, ResilienceManager, RetryPolicy,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Buffer priority for egress samples; all samples share one band so
/// per-connector ordering is plain FIFO.
const SAMPLE_PRIORITY: u8 = 5;

/// Sliding window for connector error rates.
const ERROR_WINDOW: Duration = Duration::from_secs(60);

struct OutcomeWindow {
    outcomes: Mutex<std::collections::VecDeque<(Instant, bool)>>,
}

impl OutcomeWindow {
    fn new() -> Self {
        Self {
            outcomes: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    fn record(&self, ok: bool) {
        let now = Instant::now();
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
        let (mut total, mut failures) = (0u32, 0u32);
        for (t, ok) in outcomes.iter() {
            if now.duration_since(*t) <= ERROR_WINDOW {
                total += 1;
                if !ok {
                    failures += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }
}

/// Counters for one connector, snapshotted on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectorMetrics {
    /// Samples accepted into the connector's buffer.
    pub enqueued: u64,
    /// Samples acknowledged by the connector.
    pub delivered: u64,
    /// Delivery cycles that failed after retries.
    pub failed_cycles: u64,
    /// Samples dropped on TTL expiry.
    pub expired: u64,
    /// Samples currently buffered.
    pub buffered: usize,
}

struct ConnectorRuntime {
    connector: Arc<dyn CloudConnector>,
    config: ConnectorConfig,
    buffer: MessageBuffer,
    manager: ResilienceManager,
    notify: Notify,
    window: OutcomeWindow,
    last_comm: Mutex<Option<SystemTime>>,
    last_error: Mutex<Option<GatewayError>>,
    enqueued: std::sync::atomic::AtomicU64,
    delivered: std::sync::atomic::AtomicU64,
    failed_cycles: std::sync::atomic::AtomicU64,
    expired: std::sync::atomic::AtomicU64,
    started_at: Instant,
}

struct EgressShared {
    runtimes: HashMap<String, Arc<ConnectorRuntime>>,
    routing: RoutingTable,
    listeners: EventListeners<EgressEvent>,
    cancel: tokio_util::sync::CancellationToken,
    closed: AtomicBool,
}

/// Builder for [`EgressPipeline`].
pub struct EgressPipelineBuilder {
    connectors: Vec<(Arc<dyn CloudConnector>, ConnectorConfig)>,
    rules: Vec<RoutingRule>,
    default_connector: Option<String>,
    persistence_root: Option<PathBuf>,
    listeners: EventListeners<EgressEvent>,
}

impl Default for EgressPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EgressPipelineBuilder {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
            rules: Vec::new(),
            default_connector: None,
            persistence_root: None,
            listeners: EventListeners::new(),
        }
    }

    pub fn connector(
        mut self,
        connector: Arc<dyn CloudConnector>,
        config: ConnectorConfig,
    ) -> Self {
        self.connectors.push((connector, config));
        self
    }

    pub fn rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Connector receiving samples no rule matched.
    pub fn default_connector(mut self, name: impl Into<String>) -> Self {
        self.default_connector = Some(name.into());
        self
    }

    /// Root directory for disk-persistent connector buffers.
    pub fn persistence_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.persistence_root = Some(root.into());
        self
    }

    /// Callback invoked when a delivery cycle fails after retries.
    pub fn on_delivery_failed<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event| {
            if let EgressEvent::DeliveryFailed { connector, .. } = event {
                f(connector);
            }
        }));
        self
    }

    /// Opens the per-connector buffers (replaying persisted samples) and
    /// spawns the flush workers.
    pub fn build(self) -> Result<EgressPipeline, GatewayError> {
        let mut runtimes = HashMap::new();
        for (connector, config) in self.connectors {
            let mut buffer_config = BufferConfig::builder(config.name.clone())
                .max_size(config.buffer_size)
                .overflow(OverflowPolicy::EvictOldest);
            if let Some(ttl) = config.sample_ttl {
                buffer_config = buffer_config.message_ttl(ttl);
            }
            if config.disk_persistent {
                let root = self.persistence_root.clone().ok_or_else(|| {
                    GatewayError::UnsupportedConfig(format!(
                        "connector {:?} wants disk persistence but no persistence root is set",
                        config.name
                    ))
                })?;
                buffer_config = buffer_config.persistence(PersistenceConfig::new(root));
            }
            let buffer = MessageBuffer::open(buffer_config.build())?;

            let retry = RetryPolicy::builder()
                .max_retries(config.retry_count)
                .exponential_backoff(config.retry_delay, config.retry_delay * 16)
                .jitter(0.1)
                .name(format!("egress:{}", config.name))
                .build();
            let breaker = CircuitBreakerConfig::builder()
                .name(format!("egress:{}", config.name))
                .build()
                .into_breaker();
            let manager = ResilienceManager::new(config.name.clone(), retry, breaker);

            runtimes.insert(
                config.name.clone(),
                Arc::new(ConnectorRuntime {
                    connector,
                    config,
                    buffer,
                    manager,
                    notify: Notify::new(),
                    window: OutcomeWindow::new(),
                    last_comm: Mutex::new(None),
                    last_error: Mutex::new(None),
                    enqueued: std::sync::atomic::AtomicU64::new(0),
                    delivered: std::sync::atomic::AtomicU64::new(0),
                    failed_cycles: std::sync::atomic::AtomicU64::new(0),
                    expired: std::sync::atomic::AtomicU64::new(0),
                    started_at: Instant::now(),
                }),
            );
        }

        for rule in &self.rules {
            if !runtimes.contains_key(&rule.connector) {
                return Err(GatewayError::UnsupportedConfig(format!(
                    "routing rule targets unknown connector {:?}",
                    rule.connector
                )));
            }
        }

        let shared = Arc::new(EgressShared {
            runtimes,
            routing: RoutingTable::new(self.rules, self.default_connector),
            listeners: self.listeners,
            cancel: tokio_util::sync::CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let mut workers = Vec::new();
        for runtime in shared.runtimes.values() {
            let worker_shared = Arc::clone(&shared);
            let worker_runtime = Arc::clone(runtime);
            workers.push(tokio::spawn(flush_worker(worker_shared, worker_runtime)));
        }

        Ok(EgressPipeline {
            shared,
            workers: Mutex::new(workers),
        })
    }
}

/// Routes samples to per-connector buffers and delivers them with retry and
/// circuit breaking.
///
/// With a disk-persistent buffer, delivery is at-least-once: a sample is
/// removed from the buffer only after its batch was acknowledged, so a crash
/// between send and remove replays it. Memory-only buffers are best-effort;
/// overflow drops the oldest samples.
pub struct EgressPipeline {
    shared: Arc<EgressShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EgressPipeline {
    pub fn builder() -> EgressPipelineBuilder {
        EgressPipelineBuilder::new()
    }

    /// Routes and buffers one sample. Overflow behavior belongs to each
    /// connector's buffer; an unroutable sample is counted and dropped.
    pub fn enqueue(&self, sample: CloudSample) -> Result<(), GatewayError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Shutdown);
        }
        let targets: Vec<String> = self
            .shared
            .routing
            .route(&sample)
            .into_iter()
            .map(str::to_owned)
            .collect();
        if targets.is_empty() {
            metrics::counter!("fieldgate_egress_unrouted_total").increment(1);
            tracing::debug!(device = %sample.device_id, tag = %sample.tag_id, "sample matched no route");
            return Ok(());
        }

        for name in targets {
            let Some(runtime) = self.shared.runtimes.get(&name) else {
                continue;
            };
            let mut routed = sample.clone();
            if !runtime.connector.dedups() {
                routed
                    .metadata
                    .insert("idempotency_token".into(), routed.id.to_string());
            }
            let payload = routed.to_bytes()?;
            let message = BufferedMessage {
                id: routed.id,
                priority: SAMPLE_PRIORITY,
                created_at: routed.timestamp,
                expires_at: None,
                payload,
            };
            runtime.buffer.add(message)?;
            runtime.enqueued.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                "fieldgate_egress_enqueued_total",
                "connector" => name.clone(),
            )
            .increment(1);
            if runtime.buffer.len() >= runtime.config.batch_size {
                runtime.notify.notify_one();
            }
        }
        Ok(())
    }

    /// Buffered samples awaiting delivery to a connector.
    pub fn buffer_depth(&self, connector: &str) -> Option<usize> {
        self.shared.runtimes.get(connector).map(|r| r.buffer.len())
    }

    pub fn connector_names(&self) -> Vec<String> {
        self.shared.runtimes.keys().cloned().collect()
    }

    /// Counter snapshot for one connector.
    pub fn connector_metrics(&self, connector: &str) -> Option<ConnectorMetrics> {
        let runtime = self.shared.runtimes.get(connector)?;
        Some(ConnectorMetrics {
            enqueued: runtime.enqueued.load(Ordering::Relaxed),
            delivered: runtime.delivered.load(Ordering::Relaxed),
            failed_cycles: runtime.failed_cycles.load(Ordering::Relaxed),
            expired: runtime.expired.load(Ordering::Relaxed),
            buffered: runtime.buffer.len(),
        })
    }

    /// Health snapshot for one connector.
    pub fn health(&self, connector: &str) -> Option<HealthSnapshot> {
        let runtime = self.shared.runtimes.get(connector)?;
        let error_rate = runtime.window.error_rate();
        let state = match runtime.manager.breaker().state() {
            CircuitState::Open => HealthState::Unhealthy,
            CircuitState::HalfOpen => HealthState::Degraded,
            CircuitState::Closed if error_rate > 0.5 => HealthState::Degraded,
            CircuitState::Closed => HealthState::Healthy,
        };
        Some(HealthSnapshot {
            state,
            last_comm: *runtime.last_comm.lock(),
            error_rate,
            uptime: runtime.started_at.elapsed(),
            last_error: runtime
                .last_error
                .lock()
                .as_ref()
                .map(|e| e.code().to_string()),
        })
    }

    /// Stops intake, makes a final delivery attempt per connector up to
    /// `deadline`, then stops workers, syncs persistent buffers, and closes
    /// connectors.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Workers stop first; the final drain below is then the only sender.
        self.shared.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }

        let final_flush = async {
            for runtime in self.shared.runtimes.values() {
                drain(&self.shared, runtime).await;
            }
        };
        if tokio::time::timeout(deadline, final_flush).await.is_err() {
            tracing::warn!("egress shutdown deadline hit before buffers drained");
        }

        for runtime in self.shared.runtimes.values() {
            if let Err(err) = runtime.buffer.flush() {
                tracing::warn!(connector = %runtime.config.name, error = %err, "buffer sync failed");
            }
            let _ = runtime.connector.disconnect().await;
        }
        tracing::info!("egress pipeline stopped");
    }
}

async fn flush_worker(shared: Arc<EgressShared>, runtime: Arc<ConnectorRuntime>) {
    let mut ticker = tokio::time::interval(runtime.config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
            _ = runtime.notify.notified() => {}
        }

        let expired = runtime.buffer.sweep_expired();
        if expired > 0 {
            runtime.expired.fetch_add(expired as u64, Ordering::Relaxed);
            metrics::counter!(
                "fieldgate_egress_expired_total",
                "connector" => runtime.config.name.clone(),
            )
            .increment(expired as u64);
            shared.listeners.emit(&EgressEvent::SamplesExpired {
                connector: runtime.config.name.clone(),
                timestamp: std::time::Instant::now(),
                count: expired,
            });
        }

        drain(&shared, &runtime).await;
    }
}

/// Drains the buffer batch by batch until it is empty or a delivery cycle
/// fails. Samples are removed only after their batch is acknowledged.
async fn drain(shared: &Arc<EgressShared>, runtime: &Arc<ConnectorRuntime>) {
    loop {
        let messages = runtime.buffer.get(runtime.config.batch_size);
        if messages.is_empty() {
            return;
        }

        let mut ids: Vec<Uuid> = Vec::with_capacity(messages.len());
        let mut samples: Vec<CloudSample> = Vec::with_capacity(messages.len());
        let mut poison: Vec<Uuid> = Vec::new();
        for message in &messages {
            match CloudSample::from_bytes(&message.payload) {
                Ok(sample) => {
                    ids.push(message.id);
                    samples.push(sample);
                }
                Err(err) => {
                    tracing::warn!(
                        connector = %runtime.config.name,
                        id = %message.id,
                        error = %err,
                        "dropping undecodable buffered sample"
                    );
                    poison.push(message.id);
                }
            }
        }
        if !poison.is_empty() {
            runtime.buffer.remove(&poison);
        }
        if samples.is_empty() {
            return;
        }

        let ctx = OpContext::background();
        let connector = Arc::clone(&runtime.connector);
        let timeout = runtime.config.timeout;
        let result = runtime
            .manager
            .execute(&ctx, |_attempt| {
                let connector = Arc::clone(&connector);
                let samples = samples.clone();
                async move {
                    let send = async {
                        if !connector.is_connected() {
                            connector.connect().await?;
                        }
                        connector.send_batch(&samples).await
                    };
                    match tokio::time::timeout(timeout, send).await {
                        Ok(result) => result,
                        Err(_elapsed) => Err(GatewayError::Timeout),
                    }
                }
            })
            .await;

        match result {
            Ok(()) => {
                runtime.buffer.remove(&ids);
                runtime.window.record(true);
                runtime.delivered.fetch_add(ids.len() as u64, Ordering::Relaxed);
                *runtime.last_comm.lock() = Some(SystemTime::now());
                metrics::counter!(
                    "fieldgate_egress_delivered_total",
                    "connector" => runtime.config.name.clone(),
                )
                .increment(ids.len() as u64);
                shared.listeners.emit(&EgressEvent::BatchDelivered {
                    connector: runtime.config.name.clone(),
                    timestamp: std::time::Instant::now(),
                    count: ids.len(),
                });
            }
            Err(err) => {
                runtime.window.record(false);
                runtime.failed_cycles.fetch_add(1, Ordering::Relaxed);
                *runtime.last_error.lock() = Some(err.clone());
                metrics::counter!(
                    "fieldgate_egress_failures_total",
                    "connector" => runtime.config.name.clone(),
                )
                .increment(1);
                shared.listeners.emit(&EgressEvent::DeliveryFailed {
                    connector: runtime.config.name.clone(),
                    timestamp: std::time::Instant::now(),
                });
                tracing::warn!(
                    connector = %runtime.config.name,
                    error = %err,
                    buffered = runtime.buffer.len(),
                    "delivery cycle failed, samples stay buffered"
                );
                return;
            }
        }
    }
}
