//! Seam between the allocation engine and its volumes.
//!
//! [`Store`](super::Store) performs every read and write through a
//! [`CommitStrategy`]. The direct strategy writes straight into the volumes;
//! the write-ahead strategy buffers writes in an overlay and a log until commit.

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::volume::Volume;

/// Word and byte access to the index and physical areas.
pub trait StoreIo {
    fn index_long(&self, offset: u64) -> StoreResult<u64>;

    fn put_index_long(&mut self, offset: u64, value: u64) -> StoreResult<()>;

    fn read_phys(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()>;

    fn write_phys(&mut self, offset: u64, data: &[u8]) -> StoreResult<()>;

    /// Make the index area addressable up to `end`.
    fn ensure_index(&mut self, end: u64) -> StoreResult<()>;

    /// Make the physical area addressable up to `end`.
    fn ensure_phys(&mut self, end: u64) -> StoreResult<()>;

    fn phys_long(&self, offset: u64) -> StoreResult<u64> {
        let mut buf = [0u8; 8];
        self.read_phys(offset, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn put_phys_long(&mut self, offset: u64, value: u64) -> StoreResult<()> {
        self.write_phys(offset, &value.to_be_bytes())
    }

    fn phys_byte(&self, offset: u64) -> StoreResult<u8> {
        let mut buf = [0u8; 1];
        self.read_phys(offset, &mut buf)?;
        Ok(buf[0])
    }

    fn put_phys_byte(&mut self, offset: u64, value: u8) -> StoreResult<()> {
        self.write_phys(offset, &[value])
    }

    fn clear_phys(&mut self, start: u64, end: u64) -> StoreResult<()> {
        let zeros = vec![0u8; (end - start) as usize];
        self.write_phys(start, &zeros)
    }
}

/// Decides when writes reach the volumes.
pub trait CommitStrategy: StoreIo + Send + Sync + Sized {
    /// Short name used in logs.
    const NAME: &'static str;

    /// Take ownership of freshly opened volumes. Crash recovery runs here.
    fn open(index: Box<dyn Volume>, phys: Box<dyn Volume>, config: &StoreConfig)
    -> StoreResult<Self>;

    /// Persist the allocator counters after every mutation instead of only at commit.
    fn eager_counters(&self) -> bool;

    fn has_uncommitted(&self) -> bool;

    fn commit(&mut self) -> StoreResult<()>;

    fn rollback(&mut self) -> StoreResult<()>;

    fn can_rollback(&self) -> bool;

    fn sync(&self) -> StoreResult<()>;

    /// Release the volumes, removing their files when `delete_files` is set.
    fn close(&mut self, delete_files: bool) -> StoreResult<()>;

    /// Direct access to the underlying volumes, bypassing any buffering.
    fn volumes_mut(&mut self) -> (&mut dyn Volume, &mut dyn Volume);
}
