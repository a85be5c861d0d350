//! Subscription fan-out with bounded, latest-wins delivery.

use fieldgate_core::{DeviceId, TagId, TagValue};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// One value update delivered to subscribers.
#[derive(Debug, Clone)]
pub struct TagUpdate {
    pub device_id: DeviceId,
    pub tag_id: TagId,
    pub value: TagValue,
}

/// What a subscriber wants to see. `None` means "any".
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub device_id: Option<DeviceId>,
    pub tag_id: Option<TagId>,
}

impl SubscriptionFilter {
    pub fn device(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            tag_id: None,
        }
    }

    pub fn tag(device_id: impl Into<DeviceId>, tag_id: impl Into<TagId>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            tag_id: Some(tag_id.into()),
        }
    }

    pub fn matches(&self, device_id: &str, tag_id: &str) -> bool {
        self.device_id.as_deref().map_or(true, |d| d == device_id)
            && self.tag_id.as_deref().map_or(true, |t| t == tag_id)
    }
}

/// Bounded delivery queue: when full, the oldest update is dropped so the
/// latest always fits. Publishers never wait.
struct SubQueue {
    queue: Mutex<VecDeque<TagUpdate>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubQueue {
    fn push(&self, update: TagUpdate) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("fieldgate_subscription_dropped_total").increment(1);
            }
            queue.push_back(update);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct SubEntry {
    filter: SubscriptionFilter,
    queue: Arc<SubQueue>,
}

type SubMap = RwLock<HashMap<Uuid, SubEntry>>;

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    queue: Arc<SubQueue>,
    subs: Arc<SubMap>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next update, or `None` once the subscription is closed and drained.
    pub async fn recv(&self) -> Option<TagUpdate> {
        loop {
            if let Some(update) = self.queue.queue.lock().pop_front() {
                return Some(update);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<TagUpdate> {
        self.queue.queue.lock().pop_front()
    }

    /// Updates dropped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subs.write().remove(&self.id);
        self.queue.close();
    }
}

/// Registry of subscribers, indexed by subscription id.
///
/// Subscribers hold handles; the hub holds the bounded sinks. There is no
/// reference cycle: dropping a [`Subscription`] removes its entry.
pub struct SubscriptionHub {
    subs: Arc<SubMap>,
    capacity: usize,
}

impl SubscriptionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subs: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubQueue {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.subs.write().insert(
            id,
            SubEntry {
                filter,
                queue: Arc::clone(&queue),
            },
        );
        Subscription {
            id,
            queue,
            subs: Arc::clone(&self.subs),
        }
    }

    /// Removes a subscription by id; idempotent.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        match self.subs.write().remove(&id) {
            Some(entry) => {
                entry.queue.close();
                true
            }
            None => false,
        }
    }

    /// Delivers an update to every matching subscriber without ever
    /// blocking the caller.
    pub fn publish(&self, update: &TagUpdate) {
        let subs = self.subs.read();
        for entry in subs.values() {
            if entry.filter.matches(&update.device_id, &update.tag_id) {
                entry.queue.push(update.clone());
            }
        }
    }

    /// Whether any subscriber's filter covers this tag.
    pub fn has_subscriber(&self, device_id: &str, tag_id: &str) -> bool {
        self.subs
            .read()
            .values()
            .any(|e| e.filter.matches(device_id, tag_id))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }

    /// Closes every subscription (used at gateway shutdown).
    pub fn close_all(&self) {
        let mut subs = self.subs.write();
        for (_, entry) in subs.drain() {
            entry.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::{Quality, Value};
    use std::time::{Duration, SystemTime};

    fn update(device: &str, tag: &str, v: u16) -> TagUpdate {
        TagUpdate {
            device_id: device.into(),
            tag_id: tag.into(),
            value: TagValue {
                value: Value::UInt16(v),
                quality: Quality::Good,
                timestamp: SystemTime::now(),
                read_latency: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn filters_scope_delivery() {
        let hub = SubscriptionHub::new(16);
        let all = hub.subscribe(SubscriptionFilter::default());
        let one_device = hub.subscribe(SubscriptionFilter::device("plc-1"));
        let one_tag = hub.subscribe(SubscriptionFilter::tag("plc-1", "temp"));

        hub.publish(&update("plc-2", "pressure", 1));

        assert!(all.try_recv().is_some());
        assert!(one_device.try_recv().is_none());
        assert!(one_tag.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscribers_lose_oldest_updates() {
        let hub = SubscriptionHub::new(2);
        let sub = hub.subscribe(SubscriptionFilter::default());

        for i in 0..5 {
            hub.publish(&update("plc-1", "t", i));
        }

        // Latest two survive.
        let first = sub.try_recv().unwrap();
        let second = sub.try_recv().unwrap();
        assert_eq!(first.value.value, Value::UInt16(3));
        assert_eq!(second.value.value, Value::UInt16(4));
        assert_eq!(sub.dropped(), 3);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let hub = Arc::new(SubscriptionHub::new(16));
        let sub = hub.subscribe(SubscriptionFilter::default());

        let publisher = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&update("plc-1", "t", 42));
        });

        let got = sub.recv().await.unwrap();
        assert_eq!(got.value.value, Value::UInt16(42));
    }

    #[tokio::test]
    async fn dropping_the_handle_unsubscribes() {
        let hub = SubscriptionHub::new(16);
        let sub = hub.subscribe(SubscriptionFilter::default());
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn explicit_unsubscribe_is_idempotent() {
        let hub = SubscriptionHub::new(16);
        let sub = hub.subscribe(SubscriptionFilter::default());
        let id = sub.id();
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
    }

    #[tokio::test]
    async fn closed_subscriptions_drain_then_end() {
        let hub = SubscriptionHub::new(16);
        let sub = hub.subscribe(SubscriptionFilter::default());
        hub.publish(&update("plc-1", "t", 1));
        hub.close_all();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
