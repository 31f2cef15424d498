//! Log-structured engine: every record version is appended to numbered
//! segment files and an in-memory table tracks where each recid lives.
//!
//! Segment layout (`<path>.<n>`):
//!
//! ```text
//! [APPEND_HEADER]
//! [recid u64][size i32][payload ...]      size -1: null, -3: tombstone
//! [COMMIT u64][crc32 of the batch u32]
//! [ROLLBACK u64]
//! [EOF u64]                               continues in <path>.<n+1>
//! ```
//!
//! The table is rebuilt on open by replaying every segment in order. Records
//! after the last COMMIT or ROLLBACK marker belong to a batch that never
//! committed and are dropped.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{HeaderPolicy, StoreConfig, VolumeKind};
use crate::engine::{CasCheck, Engine, RECID_LAST_RESERVED, Recid, check_writable};
use crate::error::{StoreError, StoreResult};
use crate::volume::{Volume, open_volume};

pub const APPEND_HEADER: u64 = u64::from_be_bytes(*b"RSTAPND1");

const MARK_EOF: u64 = u64::MAX;
const MARK_COMMIT: u64 = u64::MAX - 1;
const MARK_ROLLBACK: u64 = u64::MAX - 2;

const SIZE_NULL: i32 = -1;
const SIZE_TOMBSTONE: i32 = -3;

const SEGMENT_START: u64 = 8;
const RECORD_HEADER: u64 = 12;
const COMMIT_LEN: u64 = 12;

/// What a recid's latest version says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Data { offset: u64, size: u32 },
    Null,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AppendLoc {
    segment: u64,
    slot: Slot,
}

enum Entry<'a> {
    Data(&'a [u8]),
    Null,
    Tombstone,
}

/// Segment and record accounting of an append-only store.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AppendStats {
    pub segments: u64,
    pub first_segment: u64,
    pub current_segment: u64,
    pub max_recid: Recid,
    pub live_records: u64,
    pub null_records: u64,
    pub deleted_records: u64,
    /// Payload bytes of live records.
    pub live_bytes: u64,
    /// Bytes written to segments, superseded versions included.
    pub segment_bytes: u64,
}

pub struct StoreAppend {
    inner: RwLock<AppendInner>,
    closed: AtomicBool,
    read_only: bool,
    delete_files_on_close: bool,
}

struct AppendInner {
    segments: BTreeMap<u64, Box<dyn Volume>>,
    current: u64,
    /// Write position in the current segment.
    pos: u64,
    committed: HashMap<Recid, AppendLoc>,
    pending: HashMap<Recid, AppendLoc>,
    /// Checksum of the record bytes written since the last marker.
    crc: crc32fast::Hasher,
    batch_bytes: u64,
    /// Segments written since the last commit.
    touched: Vec<u64>,
    committed_max: Recid,
    max_recid: Recid,
    path: Option<PathBuf>,
    kind: VolumeKind,
    slice_shift: u32,
    segment_size: u64,
    sync_on_commit: bool,
    read_only: bool,
}

/// Segment numbers already on disk next to `base`, ascending.
fn list_segments(base: &std::path::Path) -> StoreResult<Vec<u64>> {
    let dir = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(stem) = base.file_name().and_then(|n| n.to_str()) else {
        return Err(StoreError::Config(format!(
            "store path {} has no file name",
            base.display()
        )));
    };
    let prefix = format!("{stem}.");

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = suffix.parse::<u64>() {
                found.push(n);
            }
        }
    }
    found.sort_unstable();
    Ok(found)
}

impl AppendInner {
    fn segment_path(&self, n: u64) -> Option<PathBuf> {
        self.path.as_ref().map(|base| {
            let mut name = base.as_os_str().to_owned();
            name.push(format!(".{n}"));
            PathBuf::from(name)
        })
    }

    fn open_segment(&self, n: u64, read_only: bool) -> StoreResult<Box<dyn Volume>> {
        open_volume(
            self.kind,
            self.segment_path(n).as_deref(),
            self.slice_shift,
            read_only,
        )
    }

    fn create_segment(&mut self, n: u64) -> StoreResult<()> {
        let mut vol = self.open_segment(n, false)?;
        vol.truncate(0)?;
        vol.ensure_available(SEGMENT_START)?;
        vol.put_long(0, APPEND_HEADER)?;
        self.segments.insert(n, vol);
        self.current = n;
        self.pos = SEGMENT_START;
        debug!(segment = n, "Started segment");
        Ok(())
    }

    fn volume(&self, n: u64) -> StoreResult<&dyn Volume> {
        self.segments
            .get(&n)
            .map(|v| v.as_ref())
            .ok_or_else(|| StoreError::Corrupt(format!("segment {n} is not open")))
    }

    fn current_mut(&mut self) -> StoreResult<&mut Box<dyn Volume>> {
        let n = self.current;
        self.segments
            .get_mut(&n)
            .ok_or_else(|| StoreError::Corrupt(format!("segment {n} is not open")))
    }

    fn write(&mut self, bytes: &[u8]) -> StoreResult<()> {
        let pos = self.pos;
        let vol = self.current_mut()?;
        vol.ensure_available(pos + bytes.len() as u64)?;
        vol.put_data(pos, bytes)?;
        self.pos += bytes.len() as u64;
        if self.touched.last() != Some(&self.current) {
            self.touched.push(self.current);
        }
        Ok(())
    }

    /// Close the current segment with an EOF marker and start the next one.
    fn roll_over(&mut self) -> StoreResult<()> {
        self.write(&MARK_EOF.to_be_bytes())?;
        let next = self.current + 1;
        self.create_segment(next)
    }

    fn append(&mut self, recid: Recid, entry: Entry<'_>) -> StoreResult<AppendLoc> {
        let (size, payload): (i32, &[u8]) = match entry {
            Entry::Data(data) => {
                let size = i32::try_from(data.len()).map_err(|_| StoreError::RecordTooLarge {
                    size: data.len(),
                    max: i32::MAX as usize,
                })?;
                (size, data)
            }
            Entry::Null => (SIZE_NULL, &[]),
            Entry::Tombstone => (SIZE_TOMBSTONE, &[]),
        };

        let len = RECORD_HEADER + payload.len() as u64;
        if self.pos > SEGMENT_START && self.pos + len + COMMIT_LEN > self.segment_size {
            self.roll_over()?;
        }

        let mut bytes = Vec::with_capacity(len as usize);
        bytes.extend_from_slice(&recid.to_be_bytes());
        bytes.extend_from_slice(&size.to_be_bytes());
        bytes.extend_from_slice(payload);
        let offset = self.pos + RECORD_HEADER;
        self.write(&bytes)?;
        self.crc.update(&bytes);
        self.batch_bytes += len;

        let slot = match size {
            SIZE_NULL => Slot::Null,
            SIZE_TOMBSTONE => Slot::Deleted,
            _ => Slot::Data {
                offset,
                size: size as u32,
            },
        };
        let loc = AppendLoc {
            segment: self.current,
            slot,
        };
        self.pending.insert(recid, loc);
        Ok(loc)
    }

    fn lookup(&self, recid: Recid) -> Option<AppendLoc> {
        self.pending
            .get(&recid)
            .or_else(|| self.committed.get(&recid))
            .copied()
    }

    fn read(&self, loc: AppendLoc) -> StoreResult<Option<Vec<u8>>> {
        match loc.slot {
            Slot::Data { offset, size } => {
                let mut buf = vec![0u8; size as usize];
                self.volume(loc.segment)?.get_data(offset, &mut buf)?;
                Ok(Some(buf))
            }
            Slot::Null | Slot::Deleted => Ok(None),
        }
    }

    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        if recid == 0 {
            return Err(StoreError::InvalidRecid(recid));
        }
        match self.lookup(recid) {
            Some(loc) => self.read(loc),
            None => Ok(None),
        }
    }

    /// Current value of a recid that may be updated or deleted.
    fn live(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        if recid == 0 || recid > self.max_recid {
            return Err(StoreError::InvalidRecid(recid));
        }
        match self.lookup(recid) {
            Some(AppendLoc {
                slot: Slot::Deleted,
                ..
            }) => Err(StoreError::AlreadyDeleted(recid)),
            Some(loc) => self.read(loc),
            // reserved recids start out null
            None if recid <= RECID_LAST_RESERVED => Ok(None),
            None => Err(StoreError::InvalidRecid(recid)),
        }
    }

    fn next_recid(&mut self) -> Recid {
        self.max_recid += 1;
        self.max_recid
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.batch_bytes == 0 && self.pending.is_empty() {
            return Ok(());
        }
        let crc = std::mem::replace(&mut self.crc, crc32fast::Hasher::new()).finalize();
        let mut marker = Vec::with_capacity(COMMIT_LEN as usize);
        marker.extend_from_slice(&MARK_COMMIT.to_be_bytes());
        marker.extend_from_slice(&crc.to_be_bytes());
        self.write(&marker)?;

        if self.sync_on_commit {
            for n in std::mem::take(&mut self.touched) {
                self.volume(n)?.sync()?;
            }
        } else {
            self.touched.clear();
        }

        let records = self.pending.len();
        self.committed.extend(self.pending.drain());
        self.committed_max = self.max_recid;
        self.batch_bytes = 0;
        debug!(records, segment = self.current, "Committed batch");
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.batch_bytes > 0 {
            self.write(&MARK_ROLLBACK.to_be_bytes())?;
        }
        self.crc = crc32fast::Hasher::new();
        self.batch_bytes = 0;
        self.pending.clear();
        self.max_recid = self.committed_max;
        Ok(())
    }

    /// Rebuild the location table from the segments on disk.
    fn replay(&mut self, numbers: &[u64], header_policy: HeaderPolicy) -> StoreResult<()> {
        for &n in numbers {
            let vol = self.open_segment(n, self.read_only)?;
            let header = if vol.length() >= 8 { vol.get_long(0)? } else { 0 };
            if header != APPEND_HEADER {
                if header_policy == HeaderPolicy::Fail || self.read_only {
                    return Err(StoreError::BadHeader {
                        what: "segment",
                        found: header,
                    });
                }
                warn!(segment = n, found = %format!("{header:#018x}"), "Bad segment header, reinitializing store");
                drop(vol);
                for (_, mut open) in std::mem::take(&mut self.segments) {
                    open.close()?;
                }
                for &other in numbers {
                    if let Some(path) = self.segment_path(other) {
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                return self.create_segment(0);
            }
            self.segments.insert(n, vol);
        }

        let first = numbers[0];
        let mut resume = (first, SEGMENT_START);
        let mut batch: Vec<(Recid, AppendLoc)> = Vec::new();
        let mut crc = crc32fast::Hasher::new();
        let mut torn = None;

        'segments: for &n in numbers {
            let Some(vol) = self.segments.get(&n) else {
                return Err(StoreError::Corrupt(format!("segment {n} is not open")));
            };
            let len = vol.length();
            let mut pos = SEGMENT_START;
            loop {
                if pos + 8 > len {
                    torn = (!batch.is_empty()).then_some("segment ends without EOF marker");
                    break 'segments;
                }
                match vol.get_long(pos)? {
                    0 => {
                        torn = (!batch.is_empty()).then_some("batch without COMMIT marker");
                        break 'segments;
                    }
                    MARK_EOF => break,
                    MARK_COMMIT => {
                        if pos + COMMIT_LEN > len {
                            torn = Some("truncated COMMIT marker");
                            break 'segments;
                        }
                        let stored = vol.get_int(pos + 8)?;
                        let actual = std::mem::replace(&mut crc, crc32fast::Hasher::new()).finalize();
                        if stored != actual {
                            torn = Some("batch checksum mismatch");
                            break 'segments;
                        }
                        for (recid, loc) in batch.drain(..) {
                            self.committed_max = self.committed_max.max(recid);
                            self.committed.insert(recid, loc);
                        }
                        pos += COMMIT_LEN;
                        resume = (n, pos);
                    }
                    MARK_ROLLBACK => {
                        batch.clear();
                        crc = crc32fast::Hasher::new();
                        pos += 8;
                        resume = (n, pos);
                    }
                    recid => {
                        if pos + RECORD_HEADER > len {
                            torn = Some("truncated record header");
                            break 'segments;
                        }
                        let size = vol.get_int(pos + 8)? as i32;
                        let payload = if size >= 0 { size as u64 } else { 0 };
                        if pos + RECORD_HEADER + payload > len
                            || (size < 0 && size != SIZE_NULL && size != SIZE_TOMBSTONE)
                        {
                            torn = Some("truncated or malformed record");
                            break 'segments;
                        }
                        let mut bytes = vec![0u8; (RECORD_HEADER + payload) as usize];
                        vol.get_data(pos, &mut bytes)?;
                        crc.update(&bytes);
                        let slot = match size {
                            SIZE_NULL => Slot::Null,
                            SIZE_TOMBSTONE => Slot::Deleted,
                            _ => Slot::Data {
                                offset: pos + RECORD_HEADER,
                                size: size as u32,
                            },
                        };
                        batch.push((recid, AppendLoc { segment: n, slot }));
                        pos += RECORD_HEADER + payload;
                    }
                }
            }
        }

        if let Some(reason) = torn {
            warn!(
                segment = resume.0,
                offset = resume.1,
                dropped = batch.len(),
                reason,
                "Discarding uncommitted tail of append log"
            );
        }

        self.current = resume.0;
        self.pos = resume.1;
        self.max_recid = self.committed_max;
        if !self.read_only {
            let stale: Vec<u64> = self.segments.range(resume.0 + 1..).map(|(&n, _)| n).collect();
            for n in stale {
                if let Some(mut vol) = self.segments.remove(&n) {
                    vol.delete_file()?;
                }
            }
            let pos = self.pos;
            let vol = self.current_mut()?;
            let end = vol.length();
            if end > pos {
                vol.clear(pos, end)?;
                vol.sync()?;
            }
        }
        Ok(())
    }

    fn stats(&self) -> AppendStats {
        let mut stats = AppendStats {
            segments: self.segments.len() as u64,
            first_segment: self.segments.keys().next().copied().unwrap_or(0),
            current_segment: self.current,
            max_recid: self.max_recid,
            ..AppendStats::default()
        };
        for (&n, vol) in &self.segments {
            stats.segment_bytes += if n == self.current {
                self.pos
            } else {
                vol.length()
            };
        }
        let recids: std::collections::BTreeSet<Recid> = self
            .committed
            .keys()
            .chain(self.pending.keys())
            .copied()
            .collect();
        for recid in recids {
            match self.lookup(recid).map(|loc| loc.slot) {
                Some(Slot::Data { size, .. }) => {
                    stats.live_records += 1;
                    stats.live_bytes += size as u64;
                }
                Some(Slot::Null) => stats.null_records += 1,
                Some(Slot::Deleted) => stats.deleted_records += 1,
                None => {}
            }
        }
        stats
    }
}

impl StoreAppend {
    /// Open (or create) an append-only store as described by `config`.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let mut inner = AppendInner {
            segments: BTreeMap::new(),
            current: 0,
            pos: SEGMENT_START,
            committed: HashMap::new(),
            pending: HashMap::new(),
            crc: crc32fast::Hasher::new(),
            batch_bytes: 0,
            touched: Vec::new(),
            committed_max: RECID_LAST_RESERVED,
            max_recid: RECID_LAST_RESERVED,
            path: config.path.clone(),
            kind: config.volume,
            slice_shift: config.slice_shift,
            segment_size: config.segment_size,
            sync_on_commit: config.sync_on_commit,
            read_only: config.read_only,
        };

        let numbers = match (&config.path, config.volume) {
            (Some(base), VolumeKind::File | VolumeKind::MappedFile) => list_segments(base)?,
            _ => Vec::new(),
        };
        if numbers.is_empty() {
            if config.read_only {
                return Err(StoreError::InvalidInput(format!(
                    "no append-only store found at {:?}",
                    config.path
                )));
            }
            inner.create_segment(0)?;
        } else {
            inner.replay(&numbers, config.header_policy)?;
        }

        info!(
            engine = "append_only",
            path = ?config.path,
            segments = inner.segments.len(),
            records = inner.committed.len(),
            max_recid = inner.max_recid,
            "Opened store"
        );
        Ok(Self {
            inner: RwLock::new(inner),
            closed: AtomicBool::new(false),
            read_only: config.read_only,
            delete_files_on_close: config.delete_files_on_close,
        })
    }

    /// Volatile in-memory store.
    pub fn memory() -> StoreResult<Self> {
        Self::open(&StoreConfig::memory())
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn write_lock(&self) -> StoreResult<parking_lot::RwLockWriteGuard<'_, AppendInner>> {
        check_writable(self.closed.load(Ordering::Acquire), self.read_only)?;
        Ok(self.inner.write())
    }

    pub fn stats(&self) -> StoreResult<AppendStats> {
        self.check_open()?;
        Ok(self.inner.read().stats())
    }

    /// Move every record still held by an older segment into the current one,
    /// then delete the older segments.
    pub fn compact(&self) -> StoreResult<AppendStats> {
        let mut inner = self.write_lock()?;
        inner.commit()?;
        // Relocated records go to a fresh segment, so no batch that started in a
        // deleted segment continues into a kept one.
        if inner.pos > SEGMENT_START {
            inner.roll_over()?;
        }
        let start = inner.current;

        let mut stale: Vec<(Recid, AppendLoc)> = inner
            .committed
            .iter()
            .filter(|(_, loc)| loc.segment < start)
            .map(|(&recid, &loc)| (recid, loc))
            .collect();
        stale.sort_unstable_by_key(|(recid, _)| *recid);

        let relocated = stale.len();
        for (recid, loc) in stale {
            match loc.slot {
                Slot::Data { .. } => {
                    let data = inner.read(loc)?.unwrap_or_default();
                    inner.append(recid, Entry::Data(&data))?;
                }
                Slot::Null => {
                    inner.append(recid, Entry::Null)?;
                }
                Slot::Deleted => {
                    inner.append(recid, Entry::Tombstone)?;
                }
            }
        }
        inner.commit()?;

        let old: Vec<u64> = inner.segments.range(..start).map(|(&n, _)| n).collect();
        for n in &old {
            if let Some(mut vol) = inner.segments.remove(n) {
                vol.delete_file()?;
            }
        }
        info!(relocated, removed_segments = old.len(), "Compacted append-only store");
        Ok(inner.stats())
    }
}

impl Engine for StoreAppend {
    fn put_bytes(&self, data: &[u8]) -> StoreResult<Recid> {
        let mut inner = self.write_lock()?;
        let recid = inner.next_recid();
        inner.append(recid, Entry::Data(data))?;
        Ok(recid)
    }

    fn get_bytes(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.inner.read().get(recid)
    }

    fn update_bytes(&self, recid: Recid, data: &[u8]) -> StoreResult<()> {
        let mut inner = self.write_lock()?;
        inner.live(recid)?;
        inner.append(recid, Entry::Data(data))?;
        Ok(())
    }

    fn compare_and_swap_bytes(
        &self,
        recid: Recid,
        check: CasCheck<'_>,
        data: &[u8],
    ) -> StoreResult<bool> {
        let mut inner = self.write_lock()?;
        let current = inner.live(recid)?;
        if !check(current.as_deref())? {
            return Ok(false);
        }
        inner.append(recid, Entry::Data(data))?;
        Ok(true)
    }

    fn delete(&self, recid: Recid) -> StoreResult<()> {
        let mut inner = self.write_lock()?;
        inner.live(recid)?;
        inner.append(recid, Entry::Tombstone)?;
        Ok(())
    }

    fn preallocate(&self) -> StoreResult<Recid> {
        let mut inner = self.write_lock()?;
        let recid = inner.next_recid();
        inner.append(recid, Entry::Null)?;
        Ok(recid)
    }

    fn commit(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        self.inner.write().commit()
    }

    fn rollback(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        self.inner.write().rollback()
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut inner = self.inner.write();
        if !self.read_only {
            if !inner.pending.is_empty() {
                warn!(records = inner.pending.len(), "Discarding uncommitted changes on close");
            }
            inner.rollback()?;
        }
        for (_, mut vol) in std::mem::take(&mut inner.segments) {
            if self.delete_files_on_close {
                vol.delete_file()?;
            } else {
                if !self.read_only {
                    vol.sync()?;
                }
                vol.close()?;
            }
        }
        info!(engine = "append_only", "Closed store");
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for StoreAppend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RECID_FIRST;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> StoreConfig {
        StoreConfig::file(dir.join("append"))
            .with_engine(crate::config::EngineKind::AppendOnly)
            .with_volume(VolumeKind::File)
            .with_slice_shift(12)
            .with_segment_size(4096)
    }

    #[test]
    fn test_memory_round_trip() {
        let store = StoreAppend::memory().unwrap();
        let a = store.put_bytes(b"first").unwrap();
        assert_eq!(a, RECID_FIRST);
        let b = store.put_bytes(b"").unwrap();
        store.commit().unwrap();
        assert_eq!(store.get_bytes(a).unwrap().unwrap(), b"first");
        assert_eq!(store.get_bytes(b).unwrap(), Some(Vec::new()));
        assert_eq!(store.get_bytes(1).unwrap(), None);

        store.update_bytes(a, b"second").unwrap();
        assert_eq!(store.get_bytes(a).unwrap().unwrap(), b"second");
        store.delete(a).unwrap();
        assert_eq!(store.get_bytes(a).unwrap(), None);
        assert!(matches!(store.delete(a), Err(StoreError::AlreadyDeleted(_))));
        assert!(matches!(store.update_bytes(999, b"x"), Err(StoreError::InvalidRecid(999))));
    }

    #[test]
    fn test_rollback_discards_batch() {
        let store = StoreAppend::memory().unwrap();
        let a = store.put_bytes(b"kept").unwrap();
        store.commit().unwrap();

        store.update_bytes(a, b"changed").unwrap();
        let b = store.put_bytes(b"never").unwrap();
        store.rollback().unwrap();

        assert_eq!(store.get_bytes(a).unwrap().unwrap(), b"kept");
        assert_eq!(store.get_bytes(b).unwrap(), None);
        // the rolled back recid is handed out again
        assert_eq!(store.put_bytes(b"again").unwrap(), b);
    }

    #[test]
    fn test_reopen_replays_commits_only() {
        let dir = tempdir().unwrap();
        let (a, b, c);
        {
            let store = StoreAppend::open(&config(dir.path())).unwrap();
            a = store.put_bytes(b"alpha").unwrap();
            b = store.put_bytes(&[7u8; 1000]).unwrap();
            store.commit().unwrap();
            store.update_bytes(a, b"alpha-2").unwrap();
            store.delete(b).unwrap();
            c = store.preallocate().unwrap();
            store.commit().unwrap();
            store.put_bytes(b"lost on close").unwrap();
        }

        let store = StoreAppend::open(&config(dir.path())).unwrap();
        assert_eq!(store.get_bytes(a).unwrap().unwrap(), b"alpha-2");
        assert_eq!(store.get_bytes(b).unwrap(), None);
        assert!(matches!(store.update_bytes(b, b"x"), Err(StoreError::AlreadyDeleted(_))));
        assert_eq!(store.get_bytes(c).unwrap(), None);
        store.update_bytes(c, b"filled").unwrap();
        store.commit().unwrap();
        assert_eq!(store.get_bytes(c).unwrap().unwrap(), b"filled");
        assert_eq!(store.put_bytes(b"next").unwrap(), c + 1);
    }

    #[test]
    fn test_segments_roll_over_and_compact() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let mut recids = Vec::new();
        {
            let store = StoreAppend::open(&cfg).unwrap();
            for i in 0..40u8 {
                recids.push(store.put_bytes(&[i; 500]).unwrap());
                store.commit().unwrap();
            }
            store.delete(recids[0]).unwrap();
            for &recid in &recids[1..20] {
                store.update_bytes(recid, &[0xEE; 300]).unwrap();
            }
            store.commit().unwrap();

            let before = store.stats().unwrap();
            assert!(before.segments > 3, "{before:?}");
            let after = store.compact().unwrap();
            assert_eq!(after.first_segment, before.current_segment + 1);
            assert_eq!(after.live_records, 39);
            assert_eq!(after.deleted_records, 1);
        }
        assert!(!dir.path().join("append.0").exists());

        let store = StoreAppend::open(&cfg).unwrap();
        assert_eq!(store.get_bytes(recids[0]).unwrap(), None);
        assert!(matches!(store.delete(recids[0]), Err(StoreError::AlreadyDeleted(_))));
        for &recid in &recids[1..20] {
            assert_eq!(store.get_bytes(recid).unwrap().unwrap(), vec![0xEE; 300]);
        }
        for (i, &recid) in recids.iter().enumerate().skip(20) {
            assert_eq!(store.get_bytes(recid).unwrap().unwrap(), vec![i as u8; 500]);
        }
    }

    #[test]
    fn test_torn_batch_is_dropped() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path()).with_segment_size(1 << 20);
        let a;
        {
            let store = StoreAppend::open(&cfg).unwrap();
            a = store.put_bytes(b"stable").unwrap();
            store.commit().unwrap();
        }
        // append a record without a COMMIT marker, as a crash mid-batch leaves it
        {
            let mut vol = open_volume(VolumeKind::File, Some(&dir.path().join("append.0")), 12, false).unwrap();
            // header, the "stable" record, then its COMMIT marker
            let pos = SEGMENT_START + RECORD_HEADER + 6 + COMMIT_LEN;
            assert_eq!(vol.get_long(pos).unwrap(), 0);
            let mut rec = Vec::new();
            rec.extend_from_slice(&a.to_be_bytes());
            rec.extend_from_slice(&5i32.to_be_bytes());
            rec.extend_from_slice(b"stray");
            vol.put_data(pos, &rec).unwrap();
            vol.sync().unwrap();
        }

        let store = StoreAppend::open(&cfg).unwrap();
        assert_eq!(store.get_bytes(a).unwrap().unwrap(), b"stable");
        store.update_bytes(a, b"after").unwrap();
        store.commit().unwrap();
        drop(store);

        let store = StoreAppend::open(&cfg).unwrap();
        assert_eq!(store.get_bytes(a).unwrap().unwrap(), b"after");
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        {
            let store = StoreAppend::open(&config(dir.path())).unwrap();
            store.put_bytes(b"x").unwrap();
            store.commit().unwrap();
        }
        let store = StoreAppend::open(&config(dir.path()).with_read_only(true)).unwrap();
        assert!(store.is_read_only());
        assert_eq!(store.get_bytes(RECID_FIRST).unwrap().unwrap(), b"x");
        assert!(matches!(store.put_bytes(b"y"), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn test_named_recids() {
        let store = StoreAppend::memory().unwrap();
        let recid = store.put_bytes(b"root").unwrap();
        store.set_named_recid("root", Some(recid)).unwrap();
        store.commit().unwrap();
        assert_eq!(store.get_named_recid("root").unwrap(), Some(recid));
        assert_eq!(store.get_named_recid("other").unwrap(), None);
    }
}
