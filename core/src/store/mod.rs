//! Paged record store with pluggable commit strategy.
//!
//! The index volume maps recids to packed index words; the physical volume
//! holds payloads in 16-byte aligned slots. Every structural change (slot and
//! recid allocation, the free lists) happens under one write lock; reads share
//! a read lock.

mod alloc;
mod check;
mod direct;
pub mod format;
mod long_stack;
mod record;
mod strategy;
mod wal;

pub use alloc::PagedAllocator;
pub use check::StoreStats;
pub use direct::DirectCommit;
pub use format::{ChunkRef, IndexWord, Location};
pub use long_stack::{LongStackContents, long_stack_walk};
pub use strategy::{CommitStrategy, StoreIo};
pub use wal::{LogRecord, WalCommit};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use self::format::{
    FORMAT_VERSION, INDEX_HEADER, INITIAL_INDEX_SIZE, IO_FEATURES, IO_INDEX_SIZE, IO_PHYS_SIZE,
    MAX_REC_SIZE, PHYS_HEADER, PHYS_START, index_offset,
};
use self::record::{free_record, locate, read_record, write_record};
use crate::config::{HeaderPolicy, StoreConfig};
use crate::engine::{CasCheck, Engine, RECID_LAST_RESERVED, Recid, check_writable};
use crate::error::{StoreError, StoreResult};
use crate::pack::round_up_16;
use crate::volume::{Volume, open_volume};

/// Store whose writes are visible in the volumes immediately.
pub type StoreDirect = Store<DirectCommit>;
/// Store whose writes go through a write-ahead log and become visible on commit.
pub type StoreWal = Store<WalCommit>;

pub struct Store<C: CommitStrategy> {
    inner: RwLock<StoreInner<C>>,
    closed: AtomicBool,
    read_only: bool,
    delete_files_on_close: bool,
    path: Option<PathBuf>,
}

struct StoreInner<C> {
    io: C,
    alloc: PagedAllocator,
}

impl<C: CommitStrategy> Store<C> {
    /// Open (or create) a store as described by `config`.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let index = open_volume(
            config.volume,
            config.file_path("").as_deref(),
            config.slice_shift,
            config.read_only,
        )?;
        let phys = open_volume(
            config.volume,
            config.file_path(".p").as_deref(),
            config.slice_shift,
            config.read_only,
        )?;

        let mut io = C::open(index, phys, config)?;
        let (index, phys) = io.volumes_mut();
        prepare_volumes(index, phys, config)?;
        let alloc = PagedAllocator::load(&io, config.paranoid)?;

        info!(
            engine = C::NAME,
            path = ?config.path,
            max_recid = alloc.max_recid(),
            read_only = config.read_only,
            "Opened store"
        );
        Ok(Self {
            inner: RwLock::new(StoreInner { io, alloc }),
            closed: AtomicBool::new(false),
            read_only: config.read_only,
            delete_files_on_close: config.delete_files_on_close,
            path: config.path.clone(),
        })
    }

    /// Volatile in-memory store.
    pub fn memory() -> StoreResult<Self> {
        Self::open(&StoreConfig::memory())
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// Highest recid ever handed out.
    pub fn max_recid(&self) -> Recid {
        self.inner.read().alloc.max_recid()
    }

    /// Current index word of `recid`, if it was ever written.
    pub fn index_word(&self, recid: Recid) -> StoreResult<Option<IndexWord>> {
        self.check_open()?;
        self.inner.read().index_word(recid)
    }

    /// Where the payload of `recid` lives.
    pub fn location(&self, recid: Recid) -> StoreResult<Option<Location>> {
        self.check_open()?;
        let inner = self.inner.read();
        match inner.index_word(recid)? {
            Some(word) if word.has_value() => Ok(Some(locate(&inner.io, &word)?)),
            _ => Ok(None),
        }
    }

    /// Force the volumes to durable storage.
    pub fn sync(&self) -> StoreResult<()> {
        self.check_open()?;
        self.inner.read().io.sync()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Run `f` under the write lock, persisting allocator counters afterwards
    /// when the strategy writes through.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreInner<C>) -> StoreResult<R>) -> StoreResult<R> {
        check_writable(self.closed.load(Ordering::Acquire), self.read_only)?;
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let result = f(inner);
        let flushed = if inner.io.eager_counters() {
            inner.alloc.flush(&mut inner.io)
        } else {
            Ok(())
        };
        first_error(result, flushed)
    }
}

/// Report the operation's error ahead of a failure that followed it.
fn first_error<R>(result: StoreResult<R>, after: StoreResult<()>) -> StoreResult<R> {
    let value = result?;
    after.map(|()| value)
}

#[cfg(test)]
impl Store<WalCommit> {
    /// Seal the open transaction and drop the store without applying it, as a
    /// crash right after the seal would. Returns the length of the sealed log.
    pub(crate) fn crash_after_seal(self) -> StoreResult<u64> {
        let end = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            inner.alloc.flush(&mut inner.io)?;
            inner.io.seal_without_replay()?
        };
        self.closed.store(true, Ordering::Release);
        Ok(end)
    }
}

/// Create a fresh store layout or validate the existing one.
fn prepare_volumes(
    index: &mut dyn Volume,
    phys: &mut dyn Volume,
    config: &StoreConfig,
) -> StoreResult<()> {
    let index_header = if index.length() >= 8 {
        index.get_long(0)?
    } else {
        0
    };
    if index_header == 0 {
        if config.read_only {
            return Err(StoreError::InvalidInput(format!(
                "no store found at {:?}",
                config.path
            )));
        }
        return initialize(index, phys);
    }

    let phys_header = if phys.length() >= 8 {
        phys.get_long(0)?
    } else {
        0
    };
    let mismatch = if index_header != INDEX_HEADER {
        Some(("index", index_header))
    } else if phys_header != PHYS_HEADER {
        Some(("physical", phys_header))
    } else {
        None
    };

    if let Some((what, found)) = mismatch {
        if config.header_policy == HeaderPolicy::Fail || config.read_only {
            return Err(StoreError::BadHeader { what, found });
        }
        warn!(what, found = %format!("{found:#018x}"), "Bad volume header, reinitializing store");
        index.truncate(0)?;
        phys.truncate(0)?;
        return initialize(index, phys);
    }

    let version = index.get_long(IO_FEATURES)?;
    if version != FORMAT_VERSION {
        return Err(StoreError::Unsupported(format!(
            "store format version {version}, expected {FORMAT_VERSION}"
        )));
    }
    Ok(())
}

fn initialize(index: &mut dyn Volume, phys: &mut dyn Volume) -> StoreResult<()> {
    index.ensure_available(INITIAL_INDEX_SIZE)?;
    index.clear(0, INITIAL_INDEX_SIZE)?;
    index.put_long(IO_INDEX_SIZE, INITIAL_INDEX_SIZE)?;
    index.put_long(IO_PHYS_SIZE, PHYS_START)?;
    index.put_long(IO_FEATURES, FORMAT_VERSION)?;
    for recid in 1..=RECID_LAST_RESERVED {
        index.put_long(index_offset(recid), IndexWord::null().encode())?;
    }

    phys.ensure_available(PHYS_START)?;
    phys.put_long(0, PHYS_HEADER)?;
    phys.put_long(8, 0)?;

    // Header last: a store interrupted while initializing still reads as fresh.
    index.put_long(0, INDEX_HEADER)?;
    phys.sync()?;
    index.sync()?;
    debug!("Initialized new store");
    Ok(())
}

impl<C: CommitStrategy> StoreInner<C> {
    fn index_word(&self, recid: Recid) -> StoreResult<Option<IndexWord>> {
        if recid > self.alloc.max_recid() {
            return Ok(None);
        }
        let offset = index_offset(recid);
        IndexWord::decode(self.io.index_long(offset)?).map_err(|e| e.at(offset))
    }

    /// Index word of a recid that may be updated or deleted.
    fn live_word(&self, recid: Recid) -> StoreResult<IndexWord> {
        if recid == 0 || recid > self.alloc.max_recid() {
            return Err(StoreError::InvalidRecid(recid));
        }
        match self.index_word(recid)? {
            None => Err(StoreError::InvalidRecid(recid)),
            Some(word) if word.is_unused() => Err(StoreError::AlreadyDeleted(recid)),
            Some(word) => Ok(word),
        }
    }

    fn put_word(&mut self, recid: Recid, word: IndexWord) -> StoreResult<()> {
        self.io.put_index_long(index_offset(recid), word.encode())
    }

    fn get(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        if recid == 0 {
            return Err(StoreError::InvalidRecid(recid));
        }
        match self.index_word(recid)? {
            Some(word) if word.has_value() => Ok(Some(read_record(&self.io, &word)?)),
            _ => Ok(None),
        }
    }

    fn put(&mut self, data: &[u8]) -> StoreResult<Recid> {
        let recid = self.alloc.alloc_recid(&mut self.io)?;
        let word = write_record(&mut self.alloc, &mut self.io, data)?;
        self.put_word(recid, word)?;
        Ok(recid)
    }

    fn preallocate(&mut self) -> StoreResult<Recid> {
        let recid = self.alloc.alloc_recid(&mut self.io)?;
        self.put_word(recid, IndexWord::null())?;
        Ok(recid)
    }

    fn update(&mut self, recid: Recid, data: &[u8]) -> StoreResult<()> {
        let old = self.live_word(recid)?;
        self.replace(recid, old, data)
    }

    fn replace(&mut self, recid: Recid, old: IndexWord, data: &[u8]) -> StoreResult<()> {
        let same_slot = old.has_slot()
            && !old.is_linked()
            && !data.is_empty()
            && data.len() <= MAX_REC_SIZE
            && round_up_16(data.len() as u64) == round_up_16(old.size);
        if same_slot {
            self.io.write_phys(old.offset, data)?;
            if data.len() as u64 != old.size {
                self.put_word(recid, IndexWord::new(data.len(), old.offset, 0))?;
            }
            return Ok(());
        }

        free_record(&mut self.alloc, &mut self.io, &old)?;
        let word = write_record(&mut self.alloc, &mut self.io, data)?;
        self.put_word(recid, word)
    }

    fn delete(&mut self, recid: Recid) -> StoreResult<()> {
        let old = self.live_word(recid)?;
        free_record(&mut self.alloc, &mut self.io, &old)?;
        self.put_word(recid, IndexWord::unused())?;
        self.alloc.release_recid(&mut self.io, recid)
    }

    fn compare_and_swap(
        &mut self,
        recid: Recid,
        check: CasCheck<'_>,
        data: &[u8],
    ) -> StoreResult<bool> {
        let old = self.live_word(recid)?;
        let current = if old.has_value() {
            Some(read_record(&self.io, &old)?)
        } else {
            None
        };
        if !check(current.as_deref())? {
            return Ok(false);
        }
        self.replace(recid, old, data)?;
        Ok(true)
    }
}

impl<C: CommitStrategy> Engine for Store<C> {
    fn put_bytes(&self, data: &[u8]) -> StoreResult<Recid> {
        self.mutate(|inner| inner.put(data))
    }

    fn get_bytes(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.inner.read().get(recid)
    }

    fn update_bytes(&self, recid: Recid, data: &[u8]) -> StoreResult<()> {
        self.mutate(|inner| inner.update(recid, data))
    }

    fn compare_and_swap_bytes(
        &self,
        recid: Recid,
        check: CasCheck<'_>,
        data: &[u8],
    ) -> StoreResult<bool> {
        self.mutate(|inner| inner.compare_and_swap(recid, check, data))
    }

    fn delete(&self, recid: Recid) -> StoreResult<()> {
        self.mutate(|inner| inner.delete(recid))
    }

    fn preallocate(&self) -> StoreResult<Recid> {
        self.mutate(|inner| inner.preallocate())
    }

    fn commit(&self) -> StoreResult<()> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.alloc.flush(&mut inner.io)?;
        inner.io.commit()
    }

    fn rollback(&self) -> StoreResult<()> {
        self.check_open()?;
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.io.rollback()?;
        inner.alloc.reload(&inner.io)
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if !self.read_only && inner.io.eager_counters() {
            inner.alloc.flush(&mut inner.io)?;
        }
        inner.io.close(self.delete_files_on_close)?;
        info!(engine = C::NAME, path = ?self.path, "Closed store");
        Ok(())
    }

    fn can_rollback(&self) -> bool {
        self.inner.read().io.can_rollback()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<C: CommitStrategy> Drop for Store<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineExt, RECID_FIRST};
    use crate::serializer::{BytesSerializer, StringSerializer};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fresh_store_layout() {
        let store = StoreDirect::memory().unwrap();
        assert_eq!(store.max_recid(), RECID_LAST_RESERVED);
        for recid in 1..=RECID_LAST_RESERVED {
            assert_eq!(store.index_word(recid).unwrap(), Some(IndexWord::null()));
            assert_eq!(store.get_bytes(recid).unwrap(), None);
        }
        assert!(matches!(store.get_bytes(0), Err(StoreError::InvalidRecid(0))));
        assert_eq!(store.get_bytes(1000).unwrap(), None);
    }

    #[test]
    fn test_first_recid() {
        let store = StoreDirect::memory().unwrap();
        assert_eq!(store.put(&"x".to_string(), &StringSerializer).unwrap(), RECID_FIRST);
    }

    #[test]
    fn test_update_in_place_keeps_offset() {
        let store = StoreDirect::memory().unwrap();
        let recid = store.put(&vec![1u8; 30], &BytesSerializer).unwrap();
        let Some(Location::Single { offset, .. }) = store.location(recid).unwrap() else {
            panic!("expected a single slot");
        };
        store.update(recid, &vec![2u8; 20], &BytesSerializer).unwrap();
        assert_eq!(
            store.location(recid).unwrap(),
            Some(Location::Single { offset, size: 20 })
        );
        assert_eq!(store.get(recid, &BytesSerializer).unwrap(), Some(vec![2u8; 20]));

        // a different size class moves the record
        store.update(recid, &vec![3u8; 100], &BytesSerializer).unwrap();
        let moved = store.location(recid).unwrap();
        assert_ne!(moved, Some(Location::Single { offset, size: 100 }));
    }

    #[test]
    fn test_zero_length_records() {
        let store = StoreDirect::memory().unwrap();
        let recid = store.put_bytes(&[]).unwrap();
        assert_eq!(store.get_bytes(recid).unwrap(), Some(Vec::new()));
        store.update_bytes(recid, b"now with data").unwrap();
        assert_eq!(store.get_bytes(recid).unwrap().unwrap(), b"now with data");
        store.update_bytes(recid, &[]).unwrap();
        assert_eq!(store.get_bytes(recid).unwrap(), Some(Vec::new()));
        store.check_consistency().unwrap();
    }

    #[test]
    fn test_preallocate_then_update() {
        let store = StoreWal::memory().unwrap();
        let recid = store.preallocate().unwrap();
        assert_eq!(store.get_bytes(recid).unwrap(), None);
        store.update_bytes(recid, b"filled").unwrap();
        store.commit().unwrap();
        assert_eq!(store.get_bytes(recid).unwrap().unwrap(), b"filled");
    }

    #[test]
    fn test_errors_on_deleted_and_unknown() {
        let store = StoreDirect::memory().unwrap();
        let recid = store.put_bytes(b"gone soon").unwrap();
        store.delete(recid).unwrap();
        assert!(matches!(store.update_bytes(recid, b"x"), Err(StoreError::AlreadyDeleted(r)) if r == recid));
        assert!(matches!(store.delete(recid), Err(StoreError::AlreadyDeleted(_))));
        assert!(matches!(store.update_bytes(recid + 100, b"x"), Err(StoreError::InvalidRecid(_))));
        assert!(matches!(store.delete(0), Err(StoreError::InvalidRecid(0))));
    }

    #[test]
    fn test_direct_rollback_unsupported() {
        let store = StoreDirect::memory().unwrap();
        assert!(!store.can_rollback());
        assert!(matches!(store.rollback(), Err(StoreError::Unsupported(_))));
    }

    #[test]
    fn test_operation_error_wins_over_flush_error() {
        let both: StoreResult<()> = first_error(
            Err(StoreError::AlreadyDeleted(9)),
            Err(StoreError::Corrupt("counter write".into())),
        );
        assert!(matches!(both, Err(StoreError::AlreadyDeleted(9))));
        let flush_only = first_error(Ok(3), Err(StoreError::Corrupt("counter write".into())));
        assert!(matches!(flush_only, Err(StoreError::Corrupt(_))));
        assert_eq!(first_error(Ok(3), Ok(())).unwrap(), 3);
    }

    fn poison_free_slots<C: CommitStrategy>(store: &Store<C>, class: u64) {
        let mut guard = store.inner.write();
        let inner = &mut *guard;
        inner
            .alloc
            .long_stack_put(&mut inner.io, format::free_slot_master(class), (1u64 << 30) >> 4)
            .unwrap();
    }

    #[test]
    fn test_bad_free_slot_entry_is_corruption() {
        for paranoid in [false, true] {
            let config = StoreConfig::memory().with_paranoid(paranoid);
            let store = StoreDirect::open(&config).unwrap();
            poison_free_slots(&store, format::size_class(32));
            let err = store.put_bytes(&[7; 32]).unwrap_err();
            assert!(err.is_corruption(), "paranoid={paranoid}: {err:?}");

            let wal = StoreWal::open(&config).unwrap();
            poison_free_slots(&wal, format::SIZE_CLASSES);
            let err = wal.put_bytes(&[7; 32]).unwrap_err();
            assert!(err.is_corruption(), "paranoid={paranoid}: {err:?}");
        }
    }

    #[test]
    fn test_closed_store_rejects_calls() {
        let store = StoreWal::memory().unwrap();
        store.put_bytes(b"pending").unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.get_bytes(RECID_FIRST), Err(StoreError::Closed)));
        assert!(matches!(store.put_bytes(b"x"), Err(StoreError::Closed)));
        store.close().unwrap();
    }
}
