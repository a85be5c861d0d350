//! Bounded priority buffer with optional on-disk persistence.
//!
//! The buffer holds messages in ten priority bands (9 drains first, FIFO
//! within a band). [`get`](MessageBuffer::get) is non-destructive: consumers
//! read a batch, attempt delivery, and [`remove`](MessageBuffer::remove) by
//! id on success, which is what makes at-least-once delivery work across a
//! crash.
//!
//! With persistence enabled every accepted message is appended to a segment
//! log before it is admitted to memory; overflow then merely drops the
//! in-memory payload (the record stays on disk and is read back on demand).
//! Without persistence, overflow either rejects the new message with
//! [`GatewayError::BufferFull`] or evicts the oldest lowest-priority one,
//! per [`OverflowPolicy`].
//!
//! # Example
//!
//! ```
//! use fieldgate_buffer::{BufferConfig, BufferedMessage, MessageBuffer};
//! use bytes::Bytes;
//!
//! let buffer = MessageBuffer::open(BufferConfig::builder("unit-test").max_size(100).build())
//!     .unwrap();
//! let msg = BufferedMessage::new(5, Bytes::from_static(b"sample"));
//! let id = msg.id;
//! buffer.add(msg).unwrap();
//!
//! let batch = buffer.get(10);
//! assert_eq!(batch.len(), 1);
//! buffer.remove(&[id]);
//! assert!(buffer.is_empty());
//! ```

mod config;
mod disk;
mod events;
mod message;

pub use config::{BufferConfig, BufferConfigBuilder, OverflowPolicy, PersistenceConfig};
pub use events::BufferEvent;
pub use message::{BufferedMessage, MAX_PRIORITY};

use disk::{RecordRef, SegmentStore};
use fieldgate_core::GatewayError;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::SystemTime;
use uuid::Uuid;

const BANDS: usize = MAX_PRIORITY as usize + 1;

/// One buffered message; the payload may live in memory or only on disk.
struct Slot {
    id: Uuid,
    created_at: SystemTime,
    expires_at: Option<SystemTime>,
    payload: Option<bytes::Bytes>,
    disk: Option<RecordRef>,
    priority: u8,
}

impl Slot {
    fn in_memory(&self) -> bool {
        self.payload.is_some()
    }
}

struct Inner {
    bands: Vec<VecDeque<Slot>>,
    /// Count of slots with an in-memory payload, bounded by `max_size`.
    mem_count: usize,
    /// Total live slots (memory + disk-only).
    len: usize,
    store: Option<SegmentStore>,
}

/// A bounded priority-band FIFO buffer.
pub struct MessageBuffer {
    config: BufferConfig,
    inner: Mutex<Inner>,
}

impl MessageBuffer {
    /// Opens the buffer. With persistence configured this replays the
    /// manifest under `<root>/buffers/<name>/` before accepting writes.
    pub fn open(config: BufferConfig) -> Result<Self, GatewayError> {
        let mut inner = Inner {
            bands: (0..BANDS).map(|_| VecDeque::new()).collect(),
            mem_count: 0,
            len: 0,
            store: None,
        };

        if let Some(persistence) = &config.persistence {
            let dir = persistence.root.join("buffers").join(&config.name);
            let (store, replayed) =
                SegmentStore::open(dir, persistence.max_segment_bytes).map_err(GatewayError::from)?;
            for record in replayed {
                let band = record.message.priority.min(MAX_PRIORITY) as usize;
                let keep_in_memory = inner.mem_count < config.max_size;
                inner.bands[band].push_back(Slot {
                    id: record.message.id,
                    created_at: record.message.created_at,
                    expires_at: None,
                    payload: keep_in_memory.then(|| record.message.payload.clone()),
                    disk: Some(record.at),
                    priority: record.message.priority,
                });
                if keep_in_memory {
                    inner.mem_count += 1;
                }
                inner.len += 1;
            }
            inner.store = Some(store);
            tracing::info!(
                buffer = %config.name,
                replayed = inner.len,
                "buffer opened with persistence"
            );
        }

        let buffer = Self {
            config,
            inner: Mutex::new(inner),
        };
        buffer.record_depth();
        Ok(buffer)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Adds a message. Returns `BufferFull` only in memory-only mode with
    /// the `Reject` overflow policy.
    pub fn add(&self, msg: BufferedMessage) -> Result<(), GatewayError> {
        // Events are emitted after the lock drops; a listener is allowed to
        // call back into the buffer.
        let mut dropped: Option<Uuid> = None;
        let mut spilled: Vec<Uuid> = Vec::new();

        let mut inner = self.inner.lock();
        let band = msg.priority.min(MAX_PRIORITY) as usize;

        let disk = match inner.store.as_mut() {
            Some(store) => Some(store.append(&msg).map_err(GatewayError::from)?),
            None => None,
        };

        if inner.mem_count >= self.config.max_size && disk.is_none() {
            match self.config.overflow {
                OverflowPolicy::Reject => {
                    drop(inner);
                    metrics::counter!(
                        "fieldgate_buffer_overflows_total",
                        "buffer" => self.config.name.clone(),
                    )
                    .increment(1);
                    self.config.listeners.emit(&BufferEvent::Rejected {
                        name: self.config.name.clone(),
                        timestamp: std::time::Instant::now(),
                    });
                    return Err(GatewayError::BufferFull);
                }
                OverflowPolicy::EvictOldest => {
                    dropped = drop_oldest_lowest(&mut inner);
                }
            }
        }

        inner.bands[band].push_back(Slot {
            id: msg.id,
            created_at: msg.created_at,
            expires_at: msg.expires_at,
            payload: Some(msg.payload),
            disk,
            priority: msg.priority,
        });
        inner.mem_count += 1;
        inner.len += 1;

        // Persistent overflow: shed the oldest lowest-priority payloads from
        // memory; their records stay on disk.
        while inner.mem_count > self.config.max_size {
            match spill_one(&mut inner) {
                Some(id) => spilled.push(id),
                None => break,
            }
        }
        drop(inner);

        if let Some(id) = dropped {
            metrics::counter!(
                "fieldgate_buffer_dropped_total",
                "buffer" => self.config.name.clone(),
            )
            .increment(1);
            self.config.listeners.emit(&BufferEvent::Dropped {
                name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                id,
            });
        }
        for id in spilled {
            metrics::counter!(
                "fieldgate_buffer_spilled_total",
                "buffer" => self.config.name.clone(),
            )
            .increment(1);
            self.config.listeners.emit(&BufferEvent::Spilled {
                name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                id,
            });
        }

        self.record_depth();
        Ok(())
    }

    /// Returns up to `n` messages without removing them, highest priority
    /// first, FIFO within a band. Expired messages are skipped.
    pub fn get(&self, n: usize) -> Vec<BufferedMessage> {
        let inner = self.inner.lock();
        let now = SystemTime::now();
        let mut out = Vec::new();

        for band in (0..BANDS).rev() {
            for slot in &inner.bands[band] {
                if out.len() >= n {
                    return out;
                }
                if self.slot_expired(slot, now) {
                    continue;
                }
                match (&slot.payload, slot.disk) {
                    (Some(payload), _) => out.push(BufferedMessage {
                        id: slot.id,
                        priority: slot.priority,
                        created_at: slot.created_at,
                        expires_at: slot.expires_at,
                        payload: payload.clone(),
                    }),
                    (None, Some(at)) => match inner.store.as_ref().map(|s| s.read(at)) {
                        Some(Ok(msg)) => out.push(BufferedMessage {
                            expires_at: slot.expires_at,
                            ..msg
                        }),
                        Some(Err(err)) => {
                            tracing::warn!(
                                buffer = %self.config.name,
                                id = %slot.id,
                                error = %err,
                                "failed to read spilled record"
                            );
                        }
                        None => {}
                    },
                    (None, None) => {}
                }
            }
        }
        out
    }

    /// Removes messages by id; returns how many were found.
    pub fn remove(&self, ids: &[Uuid]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let set: HashSet<Uuid> = ids.iter().copied().collect();
        let mut inner = self.inner.lock();
        let mut removed = 0;

        for band in 0..BANDS {
            let mut queue = std::mem::take(&mut inner.bands[band]);
            queue.retain(|slot| {
                if set.contains(&slot.id) {
                    if slot.in_memory() {
                        inner.mem_count -= 1;
                    }
                    inner.len -= 1;
                    if let (Some(store), Some(at)) = (inner.store.as_mut(), slot.disk) {
                        store.mark_removed(at.segment_id);
                    }
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            inner.bands[band] = queue;
        }

        drop(inner);
        self.record_depth();
        removed
    }

    /// Total live messages, including disk-only ones.
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages whose payload is currently resident in memory.
    pub fn memory_len(&self) -> usize {
        self.inner.lock().mem_count
    }

    /// Makes accepted messages durable: fsyncs the active segment and
    /// rewrites the manifest. No-op for memory-only buffers.
    pub fn flush(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        if let Some(store) = inner.store.as_mut() {
            store.sync().map_err(GatewayError::from)?;
        }
        Ok(())
    }

    /// Drops every message, on disk included.
    pub fn clear(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        for band in &mut inner.bands {
            band.clear();
        }
        inner.mem_count = 0;
        inner.len = 0;
        if let Some(store) = inner.store.as_mut() {
            store.clear().map_err(GatewayError::from)?;
        }
        drop(inner);
        self.record_depth();
        Ok(())
    }

    /// Reaps expired messages; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = SystemTime::now();
        let expired: Vec<Uuid> = {
            let inner = self.inner.lock();
            inner
                .bands
                .iter()
                .flatten()
                .filter(|slot| self.slot_expired(slot, now))
                .map(|slot| slot.id)
                .collect()
        };
        let count = self.remove(&expired);
        if count > 0 {
            self.config.listeners.emit(&BufferEvent::Expired {
                name: self.config.name.clone(),
                timestamp: std::time::Instant::now(),
                count,
            });
        }
        count
    }

    fn slot_expired(&self, slot: &Slot, now: SystemTime) -> bool {
        let expiry = slot
            .expires_at
            .or_else(|| self.config.message_ttl.map(|ttl| slot.created_at + ttl));
        expiry.is_some_and(|e| now >= e)
    }

    fn record_depth(&self) {
        metrics::gauge!(
            "fieldgate_buffer_depth",
            "buffer" => self.config.name.clone(),
        )
        .set(self.len() as f64);
    }
}

/// Drops the front-most slot of the lowest occupied band (memory-only
/// eviction). Returns the dropped id.
fn drop_oldest_lowest(inner: &mut Inner) -> Option<Uuid> {
    for band in 0..BANDS {
        if let Some(slot) = inner.bands[band].pop_front() {
            if slot.in_memory() {
                inner.mem_count -= 1;
            }
            inner.len -= 1;
            return Some(slot.id);
        }
    }
    None
}

/// Drops the in-memory payload of the oldest lowest-priority resident slot.
/// The record remains on disk.
fn spill_one(inner: &mut Inner) -> Option<Uuid> {
    for band in 0..BANDS {
        if let Some(slot) = inner.bands[band]
            .iter_mut()
            .find(|slot| slot.in_memory() && slot.disk.is_some())
        {
            slot.payload = None;
            inner.mem_count -= 1;
            return Some(slot.id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn msg(priority: u8, payload: &[u8]) -> BufferedMessage {
        BufferedMessage::new(priority, Bytes::copy_from_slice(payload))
    }

    fn memory_buffer(max_size: usize, overflow: OverflowPolicy) -> MessageBuffer {
        MessageBuffer::open(
            BufferConfig::builder("test")
                .max_size(max_size)
                .overflow(overflow)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn fifo_within_a_band() {
        let buffer = memory_buffer(10, OverflowPolicy::Reject);
        let a = msg(5, b"a");
        let b = msg(5, b"b");
        let (a_id, b_id) = (a.id, b.id);
        buffer.add(a).unwrap();
        buffer.add(b).unwrap();

        let got = buffer.get(2);
        assert_eq!(got[0].id, a_id);
        assert_eq!(got[1].id, b_id);
    }

    #[test]
    fn higher_priority_drains_first() {
        let buffer = memory_buffer(10, OverflowPolicy::Reject);
        let low = msg(1, b"low");
        let high = msg(8, b"high");
        let high_id = high.id;
        buffer.add(low).unwrap();
        buffer.add(high).unwrap();

        let got = buffer.get(1);
        assert_eq!(got[0].id, high_id);
    }

    #[test]
    fn get_is_non_destructive_and_remove_decrements() {
        let buffer = memory_buffer(10, OverflowPolicy::Reject);
        let m = msg(0, b"x");
        let id = m.id;
        buffer.add(m).unwrap();

        assert_eq!(buffer.get(5).len(), 1);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.remove(&[id]), 1);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn reject_policy_returns_buffer_full_at_capacity() {
        let buffer = memory_buffer(2, OverflowPolicy::Reject);
        buffer.add(msg(0, b"a")).unwrap();
        buffer.add(msg(0, b"b")).unwrap();
        assert_eq!(buffer.add(msg(0, b"c")), Err(GatewayError::BufferFull));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn evict_policy_drops_oldest_lowest_priority() {
        let buffer = memory_buffer(2, OverflowPolicy::EvictOldest);
        let doomed = msg(0, b"old-low");
        let doomed_id = doomed.id;
        buffer.add(doomed).unwrap();
        buffer.add(msg(9, b"high")).unwrap();
        buffer.add(msg(5, b"new")).unwrap();

        assert_eq!(buffer.len(), 2);
        assert!(buffer.get(10).iter().all(|m| m.id != doomed_id));
    }

    #[test]
    fn expired_messages_are_skipped_and_swept() {
        let buffer = MessageBuffer::open(
            BufferConfig::builder("test")
                .max_size(10)
                .message_ttl(Duration::from_millis(0))
                .build(),
        )
        .unwrap();
        buffer.add(msg(0, b"gone")).unwrap();

        assert!(buffer.get(10).is_empty());
        assert_eq!(buffer.sweep_expired(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn per_message_expiry_beats_the_config_ttl() {
        let buffer = MessageBuffer::open(
            BufferConfig::builder("test")
                .max_size(10)
                .message_ttl(Duration::from_secs(3600))
                .build(),
        )
        .unwrap();
        let already_dead =
            msg(0, b"x").with_expiry(SystemTime::now() - Duration::from_secs(1));
        buffer.add(already_dead).unwrap();
        assert!(buffer.get(10).is_empty());
    }

    #[test]
    fn persistent_overflow_spills_instead_of_dropping() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(
            BufferConfig::builder("spill")
                .max_size(2)
                .persistence(PersistenceConfig::new(dir.path()))
                .build(),
        )
        .unwrap();

        for i in 0..5u8 {
            buffer.add(msg(0, &[i])).unwrap();
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.memory_len(), 2);

        // All five are still readable, payloads served from disk as needed.
        let got = buffer.get(10);
        assert_eq!(got.len(), 5);
        let payloads: Vec<u8> = got.iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn persistent_buffer_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = || {
            BufferConfig::builder("restart")
                .max_size(100)
                .persistence(PersistenceConfig::new(dir.path()))
                .build()
        };

        let mut ids = Vec::new();
        {
            let buffer = MessageBuffer::open(config()).unwrap();
            for i in 0..20u8 {
                let m = msg(3, &[i]);
                ids.push(m.id);
                buffer.add(m).unwrap();
            }
            buffer.flush().unwrap();
        }

        let buffer = MessageBuffer::open(config()).unwrap();
        assert_eq!(buffer.len(), 20);
        let got = buffer.get(100);
        assert_eq!(got.iter().map(|m| m.id).collect::<Vec<_>>(), ids);

        // Delivered-and-removed messages stay gone after another reopen only
        // if segments are reclaimed; remove everything and check emptiness.
        buffer.remove(&ids);
        buffer.flush().unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn clear_wipes_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = MessageBuffer::open(
            BufferConfig::builder("wipe")
                .max_size(10)
                .persistence(PersistenceConfig::new(dir.path()))
                .build(),
        )
        .unwrap();
        buffer.add(msg(0, b"a")).unwrap();
        buffer.clear().unwrap();
        assert!(buffer.is_empty());
        assert!(buffer.get(10).is_empty());
    }
}
