//! Append-only segment persistence.
//!
//! Layout under the buffer directory:
//!
//! - `manifest`: JSON list of segments `{id, first_seq, last_seq, bytes}`.
//! - `seg-<hex>.log`: append-only records:
//!   `len(u32 LE) | id(16B) | priority(u8) | created(i64 ns LE) | payload`.
//!
//! The active segment rotates once it passes `max_segment_bytes`. A segment
//! file is deleted only after every record it holds has been removed.
//! Removals are not persisted; after a crash, undelivered-but-removed
//! records may replay, which is what at-least-once delivery allows.

use crate::message::BufferedMessage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const RECORD_HEADER: usize = 16 + 1 + 8;

/// Location of one persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordRef {
    pub segment_id: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentMeta {
    id: u64,
    first_seq: u64,
    last_seq: u64,
    bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    segments: Vec<SegmentMeta>,
}

/// A record recovered during manifest replay.
pub(crate) struct ReplayedRecord {
    pub message: BufferedMessage,
    pub at: RecordRef,
}

pub(crate) struct SegmentStore {
    dir: PathBuf,
    max_segment_bytes: u64,
    segments: Vec<SegmentMeta>,
    /// Live (not yet removed) record count per segment.
    live: HashMap<u64, usize>,
    active: Option<ActiveSegment>,
    next_seq: u64,
    next_segment_id: u64,
}

struct ActiveSegment {
    id: u64,
    file: File,
    bytes: u64,
}

impl SegmentStore {
    /// Opens (or creates) the store and replays the manifest.
    ///
    /// Returned records are ordered by sequence number, oldest first.
    pub fn open(
        dir: PathBuf,
        max_segment_bytes: u64,
    ) -> io::Result<(Self, Vec<ReplayedRecord>)> {
        fs::create_dir_all(&dir)?;

        let mut manifest = read_manifest(&dir)?;
        manifest.segments.sort_by_key(|s| s.first_seq);

        let mut replayed = Vec::new();
        let mut segments = Vec::new();
        let mut live = HashMap::new();
        let mut next_seq = 0u64;
        let mut next_segment_id = 0u64;

        for meta in manifest.segments {
            let path = segment_path(&dir, meta.id);
            let records = match scan_segment(&path, meta.id) {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(
                        segment = meta.id,
                        error = %err,
                        "unreadable segment skipped during replay"
                    );
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            if records.is_empty() {
                let _ = fs::remove_file(&path);
                continue;
            }
            next_seq = next_seq.max(meta.last_seq + 1);
            next_segment_id = next_segment_id.max(meta.id + 1);
            live.insert(meta.id, records.len());
            segments.push(meta);
            replayed.extend(records);
        }

        let store = Self {
            dir,
            max_segment_bytes,
            segments,
            live,
            active: None,
            next_seq,
            next_segment_id,
        };
        store.write_manifest()?;
        Ok((store, replayed))
    }

    /// Appends a record, rotating the active segment when needed.
    pub fn append(&mut self, msg: &BufferedMessage) -> io::Result<RecordRef> {
        let record = encode_record(msg);
        let needs_rotation = self
            .active
            .as_ref()
            .map_or(true, |a| a.bytes >= self.max_segment_bytes);
        if needs_rotation {
            self.rotate()?;
        }
        let Some(active) = self.active.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "no active segment after rotation",
            ));
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        let offset = active.bytes;
        active.file.write_all(&record)?;
        active.bytes += record.len() as u64;

        if let Some(meta) = self.segments.iter_mut().find(|s| s.id == active.id) {
            meta.last_seq = seq;
            meta.bytes = active.bytes;
        }
        let segment_id = active.id;
        *self.live.entry(segment_id).or_insert(0) += 1;

        Ok(RecordRef { segment_id, offset })
    }

    /// Reads one record back.
    pub fn read(&self, at: RecordRef) -> io::Result<BufferedMessage> {
        let mut file = File::open(segment_path(&self.dir, at.segment_id))?;
        file.seek(SeekFrom::Start(at.offset))?;
        read_record(&mut file)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record"))
    }

    /// Notes that a record was removed; deletes the segment once empty.
    pub fn mark_removed(&mut self, segment_id: u64) {
        let Some(count) = self.live.get_mut(&segment_id) else {
            return;
        };
        *count = count.saturating_sub(1);
        let active_id = self.active.as_ref().map(|a| a.id);
        if *count == 0 && Some(segment_id) != active_id {
            self.delete_segment(segment_id);
        }
    }

    /// Flushes the active segment and rewrites the manifest.
    pub fn sync(&mut self) -> io::Result<()> {
        if let Some(active) = self.active.as_mut() {
            active.file.sync_data()?;
        }
        self.write_manifest()
    }

    /// Drops every segment and resets the store.
    pub fn clear(&mut self) -> io::Result<()> {
        self.active = None;
        for meta in std::mem::take(&mut self.segments) {
            let _ = fs::remove_file(segment_path(&self.dir, meta.id));
        }
        self.live.clear();
        self.write_manifest()
    }

    fn rotate(&mut self) -> io::Result<()> {
        // A sealed segment whose records were all removed while it was
        // active can be reclaimed now.
        if let Some(prev) = self.active.take() {
            if self.live.get(&prev.id).copied().unwrap_or(0) == 0 {
                self.delete_segment(prev.id);
            }
        }

        let id = self.next_segment_id;
        self.next_segment_id += 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, id))?;
        self.segments.push(SegmentMeta {
            id,
            first_seq: self.next_seq,
            last_seq: self.next_seq,
            bytes: 0,
        });
        self.live.insert(id, 0);
        self.active = Some(ActiveSegment { id, file, bytes: 0 });
        self.write_manifest()
    }

    fn delete_segment(&mut self, segment_id: u64) {
        let _ = fs::remove_file(segment_path(&self.dir, segment_id));
        self.segments.retain(|s| s.id != segment_id);
        self.live.remove(&segment_id);
        if let Err(err) = self.write_manifest() {
            tracing::warn!(segment = segment_id, error = %err, "manifest rewrite failed");
        }
    }

    fn write_manifest(&self) -> io::Result<()> {
        let manifest = Manifest {
            segments: self.segments.clone(),
        };
        let tmp = self.dir.join("manifest.tmp");
        let body = serde_json::to_vec(&manifest)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, body)?;
        fs::rename(tmp, self.dir.join("manifest"))
    }
}

fn segment_path(dir: &PathBuf, id: u64) -> PathBuf {
    dir.join(format!("seg-{id:016x}.log"))
}

fn read_manifest(dir: &PathBuf) -> io::Result<Manifest> {
    let path = dir.join("manifest");
    match fs::read(&path) {
        Ok(body) => serde_json::from_slice(&body).or_else(|err| {
            tracing::warn!(error = %err, "corrupt manifest, starting empty");
            Ok(Manifest::default())
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(err) => Err(err),
    }
}

fn scan_segment(path: &PathBuf, segment_id: u64) -> io::Result<Vec<ReplayedRecord>> {
    let mut file = File::open(path)?;
    let mut records = Vec::new();
    let mut offset = 0u64;
    while let Some(message) = read_record(&mut file) {
        let len = RECORD_HEADER + message.payload.len();
        records.push(ReplayedRecord {
            message,
            at: RecordRef { segment_id, offset },
        });
        offset += 4 + len as u64;
    }
    Ok(records)
}

fn encode_record(msg: &BufferedMessage) -> Vec<u8> {
    let body_len = RECORD_HEADER + msg.payload.len();
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.extend_from_slice(msg.id.as_bytes());
    out.push(msg.priority);
    out.extend_from_slice(&system_time_nanos(msg.created_at).to_le_bytes());
    out.extend_from_slice(&msg.payload);
    out
}

/// Reads one record at the current position; `None` on EOF or a truncated
/// tail (a crash mid-append leaves at most one partial record at the end).
fn read_record(file: &mut File) -> Option<BufferedMessage> {
    let mut len_buf = [0u8; 4];
    if read_exact_or_eof(file, &mut len_buf)? {
        return None;
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len < RECORD_HEADER {
        return None;
    }
    let mut body = vec![0u8; len];
    if read_exact_or_eof(file, &mut body)? {
        return None;
    }

    let id = Uuid::from_bytes(body[0..16].try_into().ok()?);
    let priority = body[16];
    let created = i64::from_le_bytes(body[17..25].try_into().ok()?);
    let payload = Bytes::copy_from_slice(&body[25..]);
    Some(BufferedMessage {
        id,
        priority,
        created_at: nanos_to_system_time(created),
        expires_at: None,
        payload,
    })
}

/// `Some(true)` on clean EOF at a record boundary, `Some(false)` on a full
/// read, `None` on a short read (truncated tail).
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Option<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return if filled == 0 { Some(true) } else { None },
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    Some(false)
}

fn system_time_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

fn nanos_to_system_time(nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(priority: u8, payload: &[u8]) -> BufferedMessage {
        BufferedMessage::new(priority, Bytes::copy_from_slice(payload))
    }

    #[test]
    fn append_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, replayed) = SegmentStore::open(dir.path().into(), 1 << 20).unwrap();
        assert!(replayed.is_empty());

        let m = msg(3, b"hello");
        let at = store.append(&m).unwrap();
        let back = store.read(at).unwrap();
        assert_eq!(back.id, m.id);
        assert_eq!(back.priority, 3);
        assert_eq!(back.payload, m.payload);
    }

    #[test]
    fn replay_recovers_appended_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut ids = Vec::new();
        {
            let (mut store, _) = SegmentStore::open(dir.path().into(), 1 << 20).unwrap();
            for i in 0..10u8 {
                let m = msg(0, &[i]);
                ids.push(m.id);
                store.append(&m).unwrap();
            }
            store.sync().unwrap();
        }

        let (_store, replayed) = SegmentStore::open(dir.path().into(), 1 << 20).unwrap();
        let replayed_ids: Vec<_> = replayed.iter().map(|r| r.message.id).collect();
        assert_eq!(replayed_ids, ids);
    }

    #[test]
    fn segments_rotate_and_fully_removed_segments_disappear() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny segment cap forces a rotation per record or two.
        let (mut store, _) = SegmentStore::open(dir.path().into(), 1024).unwrap();

        let mut refs = Vec::new();
        for _ in 0..8 {
            refs.push(store.append(&msg(0, &[0u8; 700])).unwrap());
        }
        store.sync().unwrap();
        let files_before = fs::read_dir(dir.path()).unwrap().count();
        assert!(files_before > 2, "expected several segment files");

        for at in &refs {
            store.mark_removed(at.segment_id);
        }
        store.sync().unwrap();
        // Only the manifest and at most the active segment remain.
        let remaining = fs::read_dir(dir.path()).unwrap().count();
        assert!(remaining <= 2, "expected segments reclaimed, found {remaining}");
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let first;
        {
            let (mut store, _) = SegmentStore::open(dir.path().into(), 1 << 20).unwrap();
            first = msg(1, b"keep");
            store.append(&first).unwrap();
            store.append(&msg(1, b"will be cut")).unwrap();
            store.sync().unwrap();
        }

        // Chop a few bytes off the tail, as a crash mid-append would.
        let seg = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with("seg-"))
            .unwrap()
            .path();
        let data = fs::read(&seg).unwrap();
        fs::write(&seg, &data[..data.len() - 5]).unwrap();

        let (_store, replayed) = SegmentStore::open(dir.path().into(), 1 << 20).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].message.id, first.id);
    }
}
