//! Write-ahead log commit strategy.
//!
//! Mutations are appended to a log volume and kept in an in-memory overlay so
//! the transaction reads its own writes; the index and physical volumes are
//! untouched until commit. Commit is two-phase:
//!
//! 1. append a `SEAL` record (record count and CRC32 of the body), sync
//! 2. write the `WAL_SEAL` word into the log header, sync
//! 3. replay the log into the volumes, sync them and delete the log
//!
//! A crash before step 2 completes leaves a log without a valid seal, which is
//! discarded on the next open. A crash after it is replayed on the next open,
//! through the same code path commit uses.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::strategy::{CommitStrategy, StoreIo};
use crate::config::{StoreConfig, VolumeKind};
use crate::error::{StoreError, StoreResult};
use crate::pack::{get_int, get_long, get_six_long, put_int, put_long, put_six_long};
use crate::volume::{Volume, for_each_slice, open_volume};

pub const WAL_HEADER: u64 = u64::from_be_bytes(*b"RSTWAL01");
pub const WAL_SEAL: u64 = u64::from_be_bytes(*b"RSTSEAL1");

/// First record byte in the log volume.
const LOG_START: u64 = 16;

/// Records never straddle a block boundary.
pub const LOG_BLOCK: u64 = 1 << 20;

/// Largest payload of a single `PHYS_ARRAY` record.
const MAX_ARRAY_CHUNK: usize = 64 * 1024;

const TAG_INDEX_LONG: u8 = 1;
const TAG_PHYS_LONG: u8 = 2;
const TAG_PHYS_SIX_LONG: u8 = 3;
const TAG_PHYS_ARRAY: u8 = 4;
const TAG_SKIP_REST_OF_BLOCK: u8 = 5;
const TAG_SEAL: u8 = 6;

const OVERLAY_PAGE_SHIFT: u32 = 12;
const OVERLAY_PAGE: usize = 1 << OVERLAY_PAGE_SHIFT;

/// One log instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    IndexLong { offset: u64, value: u64 },
    PhysLong { offset: u64, value: u64 },
    /// A long whose top 16 bits are zero.
    PhysSixLong { offset: u64, value: u64 },
    PhysArray { offset: u64, data: Vec<u8> },
    SkipRestOfBlock,
    Seal { count: u32, crc: u32 },
}

impl LogRecord {
    /// Shortest encoding for writing `value` at physical `offset`.
    pub fn phys_long(offset: u64, value: u64) -> Self {
        if value >> 48 == 0 {
            LogRecord::PhysSixLong { offset, value }
        } else {
            LogRecord::PhysLong { offset, value }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            LogRecord::IndexLong { .. } | LogRecord::PhysLong { .. } => 1 + 6 + 8,
            LogRecord::PhysSixLong { .. } => 1 + 6 + 6,
            LogRecord::PhysArray { data, .. } => 1 + 6 + 4 + data.len(),
            LogRecord::SkipRestOfBlock => 1,
            LogRecord::Seal { .. } => 1 + 4 + 4,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        match self {
            LogRecord::IndexLong { offset, value } => {
                buf[0] = TAG_INDEX_LONG;
                put_six_long(&mut buf, 1, *offset);
                put_long(&mut buf, 7, *value);
            }
            LogRecord::PhysLong { offset, value } => {
                buf[0] = TAG_PHYS_LONG;
                put_six_long(&mut buf, 1, *offset);
                put_long(&mut buf, 7, *value);
            }
            LogRecord::PhysSixLong { offset, value } => {
                buf[0] = TAG_PHYS_SIX_LONG;
                put_six_long(&mut buf, 1, *offset);
                put_six_long(&mut buf, 7, *value);
            }
            LogRecord::PhysArray { offset, data } => {
                buf[0] = TAG_PHYS_ARRAY;
                put_six_long(&mut buf, 1, *offset);
                put_int(&mut buf, 7, data.len() as u32);
                buf[11..].copy_from_slice(data);
            }
            LogRecord::SkipRestOfBlock => buf[0] = TAG_SKIP_REST_OF_BLOCK,
            LogRecord::Seal { count, crc } => {
                buf[0] = TAG_SEAL;
                put_int(&mut buf, 1, *count);
                put_int(&mut buf, 5, *crc);
            }
        }
        buf
    }
}

/// Appends records to a log volume, tracking count and checksum for the seal.
pub(crate) struct LogWriter {
    vol: Box<dyn Volume>,
    pos: u64,
    crc: crc32fast::Hasher,
    count: u32,
}

impl LogWriter {
    /// Start a fresh log in `vol`, discarding whatever it held.
    pub(crate) fn create(mut vol: Box<dyn Volume>) -> StoreResult<Self> {
        vol.truncate(0)?;
        vol.ensure_available(LOG_START)?;
        vol.put_long(0, WAL_HEADER)?;
        vol.put_long(8, 0)?;
        Ok(Self {
            vol,
            pos: LOG_START,
            crc: crc32fast::Hasher::new(),
            count: 0,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> StoreResult<()> {
        self.vol.ensure_available(self.pos + bytes.len() as u64)?;
        self.vol.put_data(self.pos, bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// Jump to the next block if `len` bytes do not fit in the current one.
    fn align(&mut self, len: usize) -> StoreResult<()> {
        let in_block = self.pos % LOG_BLOCK;
        if in_block + len as u64 > LOG_BLOCK {
            let skip = LogRecord::SkipRestOfBlock.encode();
            self.write(&skip)?;
            self.crc.update(&skip);
            self.count += 1;
            self.pos = self.pos.next_multiple_of(LOG_BLOCK);
        }
        Ok(())
    }

    pub(crate) fn append(&mut self, record: &LogRecord) -> StoreResult<()> {
        let bytes = record.encode();
        self.align(bytes.len())?;
        self.write(&bytes)?;
        self.crc.update(&bytes);
        self.count += 1;
        Ok(())
    }

    /// Make the log durable and mark it replayable. Returns the end of the log.
    pub(crate) fn seal(&mut self) -> StoreResult<u64> {
        self.align(LogRecord::Seal { count: 0, crc: 0 }.encoded_len())?;
        let seal = LogRecord::Seal {
            count: self.count,
            crc: self.crc.clone().finalize(),
        };
        self.write(&seal.encode())?;
        self.vol.sync()?;
        self.vol.put_long(8, WAL_SEAL)?;
        self.vol.sync()?;
        debug!(records = self.count, bytes = self.pos, "Sealed write-ahead log");
        Ok(self.pos)
    }

    pub(crate) fn volume(&self) -> &dyn Volume {
        self.vol.as_ref()
    }

    pub(crate) fn discard(mut self) -> StoreResult<()> {
        self.vol.delete_file()
    }
}

fn read_bytes(vol: &dyn Volume, pos: u64, len: usize) -> Result<Vec<u8>, String> {
    let mut buf = vec![0u8; len];
    vol.get_data(pos, &mut buf)
        .map_err(|_| format!("log truncated at {pos}"))?;
    Ok(buf)
}

/// Parse a sealed log. `Err` carries the reason the log must be thrown away.
pub(crate) fn read_sealed_log(vol: &dyn Volume) -> Result<Vec<LogRecord>, String> {
    let header = read_bytes(vol, 0, LOG_START as usize)?;
    if get_long(&header, 0) != WAL_HEADER {
        return Err(format!("bad log header {:#018x}", get_long(&header, 0)));
    }
    if get_long(&header, 8) != WAL_SEAL {
        return Err("log was never sealed".into());
    }

    let mut records = Vec::new();
    let mut crc = crc32fast::Hasher::new();
    let mut pos = LOG_START;
    loop {
        let tag = read_bytes(vol, pos, 1)?[0];
        let (record, bytes) = match tag {
            TAG_INDEX_LONG | TAG_PHYS_LONG => {
                let b = read_bytes(vol, pos, 15)?;
                let (offset, value) = (get_six_long(&b, 1), get_long(&b, 7));
                let record = if tag == TAG_INDEX_LONG {
                    LogRecord::IndexLong { offset, value }
                } else {
                    LogRecord::PhysLong { offset, value }
                };
                (record, b)
            }
            TAG_PHYS_SIX_LONG => {
                let b = read_bytes(vol, pos, 13)?;
                let record = LogRecord::PhysSixLong {
                    offset: get_six_long(&b, 1),
                    value: get_six_long(&b, 7),
                };
                (record, b)
            }
            TAG_PHYS_ARRAY => {
                let head = read_bytes(vol, pos, 11)?;
                let len = get_int(&head, 7) as usize;
                if len > MAX_ARRAY_CHUNK {
                    return Err(format!("oversized array record ({len} bytes) at {pos}"));
                }
                let b = read_bytes(vol, pos, 11 + len)?;
                let record = LogRecord::PhysArray {
                    offset: get_six_long(&b, 1),
                    data: b[11..].to_vec(),
                };
                (record, b)
            }
            TAG_SKIP_REST_OF_BLOCK => {
                crc.update(&[tag]);
                records.push(LogRecord::SkipRestOfBlock);
                pos = (pos + 1).next_multiple_of(LOG_BLOCK);
                continue;
            }
            TAG_SEAL => {
                let b = read_bytes(vol, pos, 9)?;
                let (count, sum) = (get_int(&b, 1), get_int(&b, 5));
                if count as usize != records.len() {
                    return Err(format!(
                        "seal expects {count} records, found {}",
                        records.len()
                    ));
                }
                if sum != crc.finalize() {
                    return Err("log checksum mismatch".into());
                }
                return Ok(records);
            }
            other => return Err(format!("unknown log tag {other} at {pos}")),
        };
        crc.update(&bytes);
        pos += bytes.len() as u64;
        records.push(record);
    }
}

/// Write every record into the volumes, in order.
pub(crate) fn apply_log(
    records: &[LogRecord],
    index: &mut dyn Volume,
    phys: &mut dyn Volume,
) -> StoreResult<()> {
    for record in records {
        match record {
            LogRecord::IndexLong { offset, value } => {
                index.ensure_available(offset + 8)?;
                index.put_long(*offset, *value)?;
            }
            LogRecord::PhysLong { offset, value } | LogRecord::PhysSixLong { offset, value } => {
                phys.ensure_available(offset + 8)?;
                phys.put_long(*offset, *value)?;
            }
            LogRecord::PhysArray { offset, data } => {
                phys.ensure_available(offset + data.len() as u64)?;
                phys.put_data(*offset, data)?;
            }
            LogRecord::SkipRestOfBlock | LogRecord::Seal { .. } => {}
        }
    }
    Ok(())
}

pub struct WalCommit {
    index: Box<dyn Volume>,
    phys: Box<dyn Volume>,
    log: Option<LogWriter>,
    log_path: Option<PathBuf>,
    log_kind: VolumeKind,
    slice_shift: u32,
    /// Index words written by the open transaction.
    dirty_index: HashMap<u64, u64>,
    /// Copy-on-write images of physical pages written by the open transaction.
    dirty_pages: HashMap<usize, Box<[u8]>>,
    sync_on_commit: bool,
    read_only: bool,
}

impl WalCommit {
    /// Replay or discard a log left behind by a crash.
    fn recover(&mut self) -> StoreResult<()> {
        let Some(path) = self.log_path.clone() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        if self.read_only {
            return Err(StoreError::Unsupported(format!(
                "write-ahead log {} needs recovery; open the store writable first",
                path.display()
            )));
        }

        let mut log = open_volume(self.log_kind, Some(&path), self.slice_shift, false)?;
        match read_sealed_log(log.as_ref()) {
            Ok(records) => {
                apply_log(&records, self.index.as_mut(), self.phys.as_mut())?;
                self.index.sync()?;
                self.phys.sync()?;
                info!(path = %path.display(), records = records.len(), "Replayed write-ahead log");
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "Discarding unsealed write-ahead log");
            }
        }
        log.delete_file()
    }

    fn log(&mut self, record: LogRecord) -> StoreResult<()> {
        if self.log.is_none() {
            let vol = match &self.log_path {
                Some(path) => open_volume(self.log_kind, Some(path), self.slice_shift, false)?,
                None => open_volume(VolumeKind::Memory, None, self.slice_shift, false)?,
            };
            self.log = Some(LogWriter::create(vol)?);
            debug!("Opened write-ahead log");
        }
        match self.log.as_mut() {
            Some(log) => log.append(&record),
            None => Err(StoreError::Corrupt("write-ahead log vanished".into())),
        }
    }

    /// Read committed physical bytes; anything past the volume end reads as zero.
    fn read_committed(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        let len = self.phys.length();
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        let available = ((len - offset) as usize).min(buf.len());
        self.phys.get_data(offset, &mut buf[..available])?;
        buf[available..].fill(0);
        Ok(())
    }

    fn apply_to_pages(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        let mut pieces = Vec::new();
        for_each_slice(offset, data.len(), OVERLAY_PAGE_SHIFT, |page, pos, range| {
            pieces.push((page, pos, range));
            Ok(())
        })?;
        for (page, pos, range) in pieces {
            if !self.dirty_pages.contains_key(&page) {
                let mut image = vec![0u8; OVERLAY_PAGE].into_boxed_slice();
                self.read_committed((page as u64) << OVERLAY_PAGE_SHIFT, &mut image)?;
                self.dirty_pages.insert(page, image);
            }
            if let Some(image) = self.dirty_pages.get_mut(&page) {
                let len = range.len();
                image[pos..pos + len].copy_from_slice(&data[range]);
            }
        }
        Ok(())
    }

    fn clear_overlay(&mut self) {
        self.dirty_index.clear();
        self.dirty_pages.clear();
    }

    fn replay_sealed(&mut self, log: LogWriter) -> StoreResult<()> {
        let records = read_sealed_log(log.volume()).map_err(|reason| {
            StoreError::Corrupt(format!("freshly sealed log does not read back: {reason}"))
        })?;
        apply_log(&records, self.index.as_mut(), self.phys.as_mut())?;
        if self.sync_on_commit {
            self.index.sync()?;
            self.phys.sync()?;
        }
        log.discard()?;
        self.clear_overlay();
        debug!(records = records.len(), "Applied write-ahead log");
        Ok(())
    }

    /// Seal the log but leave it unapplied, as a crash right after the seal would.
    #[cfg(test)]
    pub(crate) fn seal_without_replay(&mut self) -> StoreResult<u64> {
        match self.log.as_mut() {
            Some(log) => log.seal(),
            None => Ok(0),
        }
    }
}

impl StoreIo for WalCommit {
    fn index_long(&self, offset: u64) -> StoreResult<u64> {
        if let Some(value) = self.dirty_index.get(&offset) {
            return Ok(*value);
        }
        if offset + 8 > self.index.length() {
            return Ok(0);
        }
        self.index.get_long(offset)
    }

    fn put_index_long(&mut self, offset: u64, value: u64) -> StoreResult<()> {
        self.log(LogRecord::IndexLong { offset, value })?;
        self.dirty_index.insert(offset, value);
        Ok(())
    }

    fn read_phys(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        for_each_slice(offset, buf.len(), OVERLAY_PAGE_SHIFT, |page, pos, range| {
            match self.dirty_pages.get(&page) {
                Some(image) => {
                    let len = range.len();
                    buf[range].copy_from_slice(&image[pos..pos + len]);
                    Ok(())
                }
                None => {
                    let start = ((page as u64) << OVERLAY_PAGE_SHIFT) + pos as u64;
                    self.read_committed(start, &mut buf[range])
                }
            }
        })
    }

    fn write_phys(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        let mut done = 0;
        while done < data.len() {
            let len = (data.len() - done).min(MAX_ARRAY_CHUNK);
            self.log(LogRecord::PhysArray {
                offset: offset + done as u64,
                data: data[done..done + len].to_vec(),
            })?;
            done += len;
        }
        self.apply_to_pages(offset, data)
    }

    fn ensure_index(&mut self, _end: u64) -> StoreResult<()> {
        // Replay grows the index volume.
        Ok(())
    }

    fn ensure_phys(&mut self, _end: u64) -> StoreResult<()> {
        Ok(())
    }

    fn put_phys_long(&mut self, offset: u64, value: u64) -> StoreResult<()> {
        self.log(LogRecord::phys_long(offset, value))?;
        self.apply_to_pages(offset, &value.to_be_bytes())
    }
}

impl CommitStrategy for WalCommit {
    const NAME: &'static str = "wal";

    fn open(
        index: Box<dyn Volume>,
        phys: Box<dyn Volume>,
        config: &StoreConfig,
    ) -> StoreResult<Self> {
        let mut wal = Self {
            index,
            phys,
            log: None,
            log_path: config.file_path(".wal"),
            log_kind: config.volume,
            slice_shift: config.slice_shift,
            dirty_index: HashMap::new(),
            dirty_pages: HashMap::new(),
            sync_on_commit: config.sync_on_commit,
            read_only: config.read_only,
        };
        wal.recover()?;
        Ok(wal)
    }

    fn eager_counters(&self) -> bool {
        false
    }

    fn has_uncommitted(&self) -> bool {
        self.log.is_some()
    }

    fn commit(&mut self) -> StoreResult<()> {
        let Some(mut log) = self.log.take() else {
            return Ok(());
        };
        log.seal()?;
        self.replay_sealed(log)
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if let Some(log) = self.log.take() {
            log.discard()?;
            debug!("Rolled back write-ahead log");
        }
        self.clear_overlay();
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        true
    }

    fn sync(&self) -> StoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.index.sync()?;
        self.phys.sync()
    }

    fn close(&mut self, delete_files: bool) -> StoreResult<()> {
        if self.has_uncommitted() {
            warn!("Discarding uncommitted changes on close");
            self.rollback()?;
        }
        self.sync()?;
        if delete_files {
            self.index.delete_file()?;
            self.phys.delete_file()?;
        } else {
            self.index.close()?;
            self.phys.close()?;
        }
        Ok(())
    }

    fn volumes_mut(&mut self) -> (&mut dyn Volume, &mut dyn Volume) {
        (self.index.as_mut(), self.phys.as_mut())
    }
}
