//! The tag-value cache and its quality state machine.

use fieldgate_core::{DeviceId, Quality, TagId, TagValue, Value};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

struct CacheEntry {
    value: TagValue,
    /// When the last successful read landed.
    refreshed_at: Instant,
    /// Recent read errors inside the error window.
    errors: VecDeque<Instant>,
}

/// Last-observed samples per `(device, tag)`.
///
/// Single-writer by design: only the read-completion path mutates entries,
/// everyone else reads through [`get`](TagCache::get).
///
/// Quality transitions:
/// - any successful read ⇒ GOOD (or UNCERTAIN when the caller says so, e.g.
///   a value read through a half-open circuit probe),
/// - no refresh within `tag_ttl` ⇒ STALE,
/// - more than `error_threshold` read errors within `error_window` ⇒ BAD,
/// - BAD/STALE recover to GOOD on one successful read.
pub struct TagCache {
    entries: RwLock<HashMap<(DeviceId, TagId), CacheEntry>>,
    tag_ttl: Duration,
    error_window: Duration,
    error_threshold: usize,
}

impl TagCache {
    pub fn new(tag_ttl: Duration, error_window: Duration, error_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tag_ttl,
            error_window,
            error_threshold: error_threshold.max(1),
        }
    }

    pub fn get(&self, device_id: &str, tag_id: &str) -> Option<TagValue> {
        self.entries
            .read()
            .get(&(device_id.to_string(), tag_id.to_string()))
            .map(|e| e.value.clone())
    }

    /// Stores a successful read; clears the error window.
    pub(crate) fn record_success(
        &self,
        device_id: &str,
        tag_id: &str,
        value: Value,
        read_latency: Duration,
        quality: Quality,
    ) -> TagValue {
        let tag_value = TagValue {
            value,
            quality,
            timestamp: SystemTime::now(),
            read_latency,
        };
        let mut entries = self.entries.write();
        entries.insert(
            (device_id.to_string(), tag_id.to_string()),
            CacheEntry {
                value: tag_value.clone(),
                refreshed_at: Instant::now(),
                errors: VecDeque::new(),
            },
        );
        tag_value
    }

    /// Records a read error; once the window holds more than the threshold,
    /// the entry flips to BAD and the updated value is returned for fan-out.
    pub(crate) fn record_error(&self, device_id: &str, tag_id: &str) -> Option<TagValue> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&(device_id.to_string(), tag_id.to_string()))?;

        let now = Instant::now();
        entry.errors.push_back(now);
        while entry
            .errors
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.error_window)
        {
            entry.errors.pop_front();
        }

        if entry.errors.len() > self.error_threshold && entry.value.quality != Quality::Bad {
            entry.value.quality = Quality::Bad;
            return Some(entry.value.clone());
        }
        None
    }

    /// Flips unrefreshed GOOD/UNCERTAIN entries to STALE; returns the
    /// changed entries for subscriber notification.
    pub(crate) fn sweep_stale(&self) -> Vec<(DeviceId, TagId, TagValue)> {
        let mut entries = self.entries.write();
        let now = Instant::now();
        let mut changed = Vec::new();
        for ((device_id, tag_id), entry) in entries.iter_mut() {
            let fresh = now.duration_since(entry.refreshed_at) < self.tag_ttl;
            let degradable = matches!(entry.value.quality, Quality::Good | Quality::Uncertain);
            if !fresh && degradable {
                entry.value.quality = Quality::Stale;
                changed.push((device_id.clone(), tag_id.clone(), entry.value.clone()));
            }
        }
        changed
    }

    pub(crate) fn remove_device(&self, device_id: &str) {
        self.entries
            .write()
            .retain(|(device, _), _| device != device_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TagCache {
        TagCache::new(Duration::from_secs(30), Duration::from_secs(60), 3)
    }

    #[tokio::test]
    async fn successful_reads_store_good_values() {
        let c = cache();
        let stored = c.record_success(
            "plc-1",
            "temp",
            Value::Float32(20.5),
            Duration::from_millis(4),
            Quality::Good,
        );
        assert_eq!(stored.quality, Quality::Good);
        assert_eq!(c.get("plc-1", "temp").unwrap().value, Value::Float32(20.5));
    }

    #[tokio::test]
    async fn errors_over_the_threshold_flip_to_bad() {
        let c = cache();
        c.record_success(
            "plc-1",
            "temp",
            Value::Float32(1.0),
            Duration::ZERO,
            Quality::Good,
        );

        assert!(c.record_error("plc-1", "temp").is_none());
        assert!(c.record_error("plc-1", "temp").is_none());
        assert!(c.record_error("plc-1", "temp").is_none());
        let flipped = c.record_error("plc-1", "temp").unwrap();
        assert_eq!(flipped.quality, Quality::Bad);

        // One successful read recovers.
        let recovered = c.record_success(
            "plc-1",
            "temp",
            Value::Float32(2.0),
            Duration::ZERO,
            Quality::Good,
        );
        assert_eq!(recovered.quality, Quality::Good);
    }

    #[tokio::test(start_paused = true)]
    async fn unrefreshed_entries_go_stale() {
        let c = cache();
        c.record_success(
            "plc-1",
            "temp",
            Value::Float32(1.0),
            Duration::ZERO,
            Quality::Good,
        );

        assert!(c.sweep_stale().is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;
        let changed = c.sweep_stale();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].2.quality, Quality::Stale);
        assert_eq!(c.get("plc-1", "temp").unwrap().quality, Quality::Stale);

        // Stale recovers on any successful read.
        c.record_success(
            "plc-1",
            "temp",
            Value::Float32(2.0),
            Duration::ZERO,
            Quality::Good,
        );
        assert_eq!(c.get("plc-1", "temp").unwrap().quality, Quality::Good);
    }

    #[tokio::test]
    async fn bad_entries_do_not_go_stale() {
        let c = TagCache::new(Duration::from_millis(0), Duration::from_secs(60), 0);
        c.record_success("plc-1", "t", Value::Bool(true), Duration::ZERO, Quality::Good);
        c.record_error("plc-1", "t").unwrap();
        assert!(c.sweep_stale().is_empty());
    }

    #[tokio::test]
    async fn removing_a_device_clears_only_its_tags() {
        let c = cache();
        c.record_success("plc-1", "a", Value::Bool(true), Duration::ZERO, Quality::Good);
        c.record_success("plc-2", "b", Value::Bool(true), Duration::ZERO, Quality::Good);
        c.remove_device("plc-1");
        assert!(c.get("plc-1", "a").is_none());
        assert!(c.get("plc-2", "b").is_some());
    }
}
