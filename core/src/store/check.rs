//! Read-only survey of a store: statistics and structural verification.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use super::format::{
    IO_FREE_RECID, IndexWord, PHYS_START, SIZE_CLASSES, free_slot_master, index_offset,
};
use super::long_stack::long_stack_walk;
use super::record::{locate, read_record};
use super::strategy::CommitStrategy;
use super::{Store, StoreInner};
use crate::engine::Recid;
use crate::error::{StoreError, StoreResult};

/// Space and record accounting of a store.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub index_size: u64,
    pub phys_size: u64,
    pub max_recid: Recid,
    /// Recids holding a value, including zero-length ones.
    pub live_records: u64,
    pub null_records: u64,
    pub linked_records: u64,
    /// Payload bytes of all live records.
    pub record_bytes: u64,
    /// Physical bytes taken by live records, chunk headers and padding included.
    pub record_extent: u64,
    pub free_recids: u64,
    pub free_slots: u64,
    pub free_bytes: u64,
    pub long_stack_pages: u64,
    pub long_stack_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
enum Owner {
    Record(Recid),
    FreeSlot(u64),
    StackPage(u64),
}

struct Extent {
    offset: u64,
    len: u64,
    owner: Owner,
}

/// Everything the survey found, before any cross-checks.
struct Survey {
    stats: StoreStats,
    extents: Vec<Extent>,
    unused: BTreeSet<Recid>,
    free_recids: Vec<Recid>,
}

impl<C: CommitStrategy> StoreInner<C> {
    fn survey(&self, verify_payloads: bool) -> StoreResult<Survey> {
        let mut stats = StoreStats {
            index_size: self.alloc.index_size(),
            phys_size: self.alloc.phys_size(),
            max_recid: self.alloc.max_recid(),
            ..StoreStats::default()
        };
        let mut extents = Vec::new();
        let mut unused = BTreeSet::new();

        for recid in 1..=stats.max_recid {
            let offset = index_offset(recid);
            let Some(word) =
                IndexWord::decode(self.io.index_long(offset)?).map_err(|e| e.at(offset))?
            else {
                continue;
            };
            if word.is_unused() {
                unused.insert(recid);
                continue;
            }
            if word.is_null() {
                stats.null_records += 1;
                continue;
            }
            stats.live_records += 1;
            if !word.has_slot() {
                continue;
            }
            let location = locate(&self.io, &word)?;
            if word.is_linked() {
                stats.linked_records += 1;
            }
            if verify_payloads || !word.is_linked() {
                stats.record_bytes += if word.is_linked() {
                    read_record(&self.io, &word)?.len() as u64
                } else {
                    word.size
                };
            }
            for chunk in location.chunks() {
                stats.record_extent += chunk.extent();
                extents.push(Extent {
                    offset: chunk.offset,
                    len: chunk.extent(),
                    owner: Owner::Record(recid),
                });
            }
        }

        let recid_stack = long_stack_walk(&self.io, IO_FREE_RECID)?;
        stats.free_recids = recid_stack.values.len() as u64;
        for page in &recid_stack.pages {
            extents.push(Extent {
                offset: page.offset,
                len: page.extent(),
                owner: Owner::StackPage(IO_FREE_RECID),
            });
        }
        let mut pages = recid_stack.pages.len() as u64;

        for class in 1..=SIZE_CLASSES {
            let master = free_slot_master(class);
            let stack = long_stack_walk(&self.io, master)?;
            for value in &stack.values {
                stats.free_slots += 1;
                stats.free_bytes += class * 16;
                extents.push(Extent {
                    offset: value << 4,
                    len: class * 16,
                    owner: Owner::FreeSlot(class),
                });
            }
            for page in &stack.pages {
                extents.push(Extent {
                    offset: page.offset,
                    len: page.extent(),
                    owner: Owner::StackPage(master),
                });
            }
            pages += stack.pages.len() as u64;
        }

        for extent in &extents {
            if let Owner::StackPage(_) = extent.owner {
                stats.long_stack_bytes += extent.len;
            }
        }
        stats.long_stack_pages = pages;

        Ok(Survey {
            stats,
            extents,
            unused,
            free_recids: recid_stack.values,
        })
    }
}

impl<C: CommitStrategy> Store<C> {
    /// Count records and free space.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        self.check_open()?;
        Ok(self.inner.read().survey(false)?.stats)
    }

    /// Verify every checksum and that the physical area is partitioned exactly
    /// into live records, free slots and long-stack pages.
    pub fn check_consistency(&self) -> StoreResult<StoreStats> {
        self.check_open()?;
        let survey = self.inner.read().survey(true)?;
        let Survey {
            stats,
            mut extents,
            unused,
            free_recids,
        } = survey;

        for extent in &extents {
            if extent.offset % 16 != 0
                || extent.offset < PHYS_START
                || extent.offset + extent.len > stats.phys_size
            {
                return Err(StoreError::Corrupt(format!(
                    "{:?} occupies [{}, {}) outside the physical area ({} bytes)",
                    extent.owner,
                    extent.offset,
                    extent.offset + extent.len,
                    stats.phys_size
                )));
            }
        }

        extents.sort_by_key(|e| e.offset);
        let mut covered = 0;
        for pair in extents.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.offset + a.len > b.offset {
                return Err(StoreError::Corrupt(format!(
                    "{:?} at {} overlaps {:?} at {}",
                    a.owner, a.offset, b.owner, b.offset
                )));
            }
        }
        for extent in &extents {
            covered += extent.len;
        }
        let used = stats.phys_size - PHYS_START;
        if covered != used {
            return Err(StoreError::Corrupt(format!(
                "{covered} of {used} physical bytes accounted for"
            )));
        }

        let stacked: BTreeSet<Recid> = free_recids.iter().copied().collect();
        if stacked.len() != free_recids.len() {
            return Err(StoreError::Corrupt(
                "free recid stack holds duplicates".into(),
            ));
        }
        if stacked != unused {
            let missing: Vec<_> = unused.difference(&stacked).take(8).collect();
            let extra: Vec<_> = stacked.difference(&unused).take(8).collect();
            return Err(StoreError::Corrupt(format!(
                "free recid stack disagrees with index: missing {missing:?}, unexpected {extra:?}"
            )));
        }

        debug!(
            live = stats.live_records,
            free_slots = stats.free_slots,
            pages = stats.long_stack_pages,
            "Store is consistent"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::store::{StoreDirect, StoreIo, StoreWal};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fresh_store_stats() {
        let store = StoreDirect::memory().unwrap();
        let stats = store.check_consistency().unwrap();
        assert_eq!(stats.live_records, 0);
        assert_eq!(stats.null_records, 7);
        assert_eq!(stats.phys_size, PHYS_START);
        assert_eq!(stats.free_slots, 0);
    }

    #[test]
    fn test_stats_follow_deletes() {
        let store = StoreWal::memory().unwrap();
        let a = store.put_bytes(&[1u8; 40]).unwrap();
        let b = store.put_bytes(&[2u8; 100_000]).unwrap();
        store.put_bytes(b"").unwrap();
        store.commit().unwrap();

        let stats = store.check_consistency().unwrap();
        assert_eq!(stats.live_records, 3);
        assert_eq!(stats.linked_records, 1);
        assert_eq!(stats.record_bytes, 100_040);

        store.delete(a).unwrap();
        store.delete(b).unwrap();
        store.commit().unwrap();
        let stats = store.check_consistency().unwrap();
        assert_eq!(stats.live_records, 1);
        assert_eq!(stats.free_recids, 2);
        assert!(stats.free_slots >= 3);
        assert!(stats.long_stack_pages >= 1);
    }

    #[test]
    fn test_detects_overlapping_records() {
        let store = StoreDirect::memory().unwrap();
        let a = store.put_bytes(&[1u8; 32]).unwrap();
        let b = store.put_bytes(&[2u8; 32]).unwrap();
        {
            let mut guard = store.inner.write();
            let inner = &mut *guard;
            let word_a = inner.index_word(a).unwrap().unwrap();
            inner.put_word(b, word_a).unwrap();
        }
        let err = store.check_consistency().unwrap_err();
        assert!(err.is_corruption(), "{err}");
    }

    #[test]
    fn test_detects_broken_parity() {
        let store = StoreDirect::memory().unwrap();
        let recid = store.put_bytes(b"flip me").unwrap();
        {
            let mut guard = store.inner.write();
            let offset = index_offset(recid);
            let raw = guard.io.index_long(offset).unwrap();
            guard.io.put_index_long(offset, raw ^ 0x10).unwrap();
        }
        assert!(matches!(
            store.check_consistency(),
            Err(StoreError::ChecksumBroken { .. })
        ));
    }
}
