//! Recid and physical slot allocation.
//!
//! Free recids and free slots live on long stacks inside the store itself.
//! The allocator keeps the index and physical size counters in memory and
//! writes them to the index header on [`PagedAllocator::flush`].

use tracing::trace;

use super::format::{
    INDEX_BASE, INITIAL_INDEX_SIZE, IO_FREE_RECID, IO_INDEX_SIZE, IO_PHYS_SIZE, MAX_SLOT_SIZE,
    PHYS_START, SIZE_CLASSES, free_slot_master, index_offset, max_recid, size_class,
};
use super::strategy::StoreIo;
use crate::engine::Recid;
use crate::error::{StoreError, StoreResult};
use crate::pack::round_up_16;

#[derive(Debug)]
pub struct PagedAllocator {
    /// Byte end of the used physical area.
    phys_size: u64,
    /// Byte end of the used index table.
    index_size: u64,
    flushed: (u64, u64),
    paranoid: bool,
}

impl PagedAllocator {
    /// Read the counters from the index header.
    pub fn load<I: StoreIo>(io: &I, paranoid: bool) -> StoreResult<Self> {
        let mut alloc = Self {
            phys_size: 0,
            index_size: 0,
            flushed: (0, 0),
            paranoid,
        };
        alloc.reload(io)?;
        Ok(alloc)
    }

    /// Forget in-memory changes and re-read the counters.
    pub fn reload<I: StoreIo>(&mut self, io: &I) -> StoreResult<()> {
        let index_size = io.index_long(IO_INDEX_SIZE)?;
        let phys_size = io.index_long(IO_PHYS_SIZE)?;
        if index_size < INITIAL_INDEX_SIZE || (index_size - INDEX_BASE) % 8 != 0 {
            return Err(StoreError::Corrupt(format!(
                "index size counter out of range: {index_size}"
            )));
        }
        if phys_size < PHYS_START || phys_size % 16 != 0 {
            return Err(StoreError::Corrupt(format!(
                "physical size counter out of range: {phys_size}"
            )));
        }
        self.index_size = index_size;
        self.phys_size = phys_size;
        self.flushed = (index_size, phys_size);
        Ok(())
    }

    /// Write changed counters to the index header.
    pub fn flush<I: StoreIo>(&mut self, io: &mut I) -> StoreResult<()> {
        if self.flushed == (self.index_size, self.phys_size) {
            return Ok(());
        }
        io.put_index_long(IO_INDEX_SIZE, self.index_size)?;
        io.put_index_long(IO_PHYS_SIZE, self.phys_size)?;
        self.flushed = (self.index_size, self.phys_size);
        Ok(())
    }

    pub fn phys_size(&self) -> u64 {
        self.phys_size
    }

    pub fn index_size(&self) -> u64 {
        self.index_size
    }

    pub fn max_recid(&self) -> Recid {
        max_recid(self.index_size)
    }

    /// Reuse a deleted recid, or extend the index table by one word.
    pub fn alloc_recid<I: StoreIo>(&mut self, io: &mut I) -> StoreResult<Recid> {
        let reused = self.long_stack_take(io, IO_FREE_RECID)?;
        if reused != 0 {
            if reused > self.max_recid() {
                return Err(StoreError::Corrupt(format!(
                    "free recid {reused} beyond index end"
                )));
            }
            trace!(recid = reused, "Reusing recid");
            return Ok(reused);
        }
        let recid = max_recid(self.index_size) + 1;
        self.index_size += 8;
        io.ensure_index(self.index_size)?;
        debug_assert_eq!(index_offset(recid) + 8, self.index_size);
        trace!(recid, "New recid");
        Ok(recid)
    }

    pub fn release_recid<I: StoreIo>(&mut self, io: &mut I, recid: Recid) -> StoreResult<()> {
        self.long_stack_put(io, IO_FREE_RECID, recid)
    }

    /// Find a 16-aligned slot of at least `size` bytes (`1..=65536`).
    ///
    /// Reuses a slot of the exact size class, else splits a maximum-size free
    /// slot, else carves from the end of the physical area.
    pub fn alloc_slot<I: StoreIo>(&mut self, io: &mut I, size: u64) -> StoreResult<u64> {
        debug_assert!(size > 0 && size <= MAX_SLOT_SIZE, "slot size {size}");
        let rounded = round_up_16(size);
        let class = size_class(size);

        let free = self.long_stack_take(io, free_slot_master(class))?;
        if free != 0 {
            let offset = free << 4;
            self.check_free_entry(offset, rounded)?;
            trace!(offset, size = rounded, "Reusing free slot");
            return Ok(offset);
        }

        if class < SIZE_CLASSES {
            let big = self.long_stack_take(io, free_slot_master(SIZE_CLASSES))?;
            if big != 0 {
                let offset = big << 4;
                self.check_free_entry(offset, MAX_SLOT_SIZE)?;
                trace!(offset, size = rounded, "Splitting free slot");
                self.free_slot(io, offset + rounded, MAX_SLOT_SIZE - rounded)?;
                return Ok(offset);
            }
        }

        let offset = self.phys_size;
        self.phys_size += rounded;
        io.ensure_phys(self.phys_size)?;
        trace!(offset, size = rounded, "Carving slot from physical end");
        Ok(offset)
    }

    /// Return a slot to the free-slot stack of its size class.
    pub fn free_slot<I: StoreIo>(&mut self, io: &mut I, offset: u64, size: u64) -> StoreResult<()> {
        let rounded = round_up_16(size);
        self.check_extent(offset, rounded)?;
        trace!(offset, size = rounded, "Freeing slot");
        self.long_stack_put(io, free_slot_master(size_class(size)), offset >> 4)
    }

    fn in_phys_area(&self, offset: u64, size: u64) -> bool {
        offset >= PHYS_START && offset.saturating_add(size) <= self.phys_size
    }

    /// Free-slot entries come from the file, so a bad one means corruption.
    fn check_free_entry(&self, offset: u64, size: u64) -> StoreResult<()> {
        if !self.in_phys_area(offset, size) {
            return Err(StoreError::Corrupt(format!(
                "free slot [{offset}, +{size}) outside physical area ({})",
                self.phys_size
            )));
        }
        Ok(())
    }

    fn check_extent(&self, offset: u64, size: u64) -> StoreResult<()> {
        let valid = offset % 16 == 0 && self.in_phys_area(offset, size);
        debug_assert!(valid, "slot [{offset}, +{size}) outside physical area");
        if self.paranoid && !valid {
            return Err(StoreError::InvalidInput(format!(
                "slot [{offset}, +{size}) outside physical area ({})",
                self.phys_size
            )));
        }
        Ok(())
    }
}
