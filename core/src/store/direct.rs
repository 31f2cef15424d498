//! Commit strategy without a journal: every write lands in the volumes at once.

use tracing::debug;

use super::strategy::{CommitStrategy, StoreIo};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::volume::Volume;

pub struct DirectCommit {
    index: Box<dyn Volume>,
    phys: Box<dyn Volume>,
    sync_on_commit: bool,
}

impl StoreIo for DirectCommit {
    fn index_long(&self, offset: u64) -> StoreResult<u64> {
        self.index.get_long(offset)
    }

    fn put_index_long(&mut self, offset: u64, value: u64) -> StoreResult<()> {
        self.index.put_long(offset, value)
    }

    fn read_phys(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        self.phys.get_data(offset, buf)
    }

    fn write_phys(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        self.phys.put_data(offset, data)
    }

    fn ensure_index(&mut self, end: u64) -> StoreResult<()> {
        self.index.ensure_available(end)
    }

    fn ensure_phys(&mut self, end: u64) -> StoreResult<()> {
        self.phys.ensure_available(end)
    }

    fn phys_long(&self, offset: u64) -> StoreResult<u64> {
        self.phys.get_long(offset)
    }

    fn put_phys_long(&mut self, offset: u64, value: u64) -> StoreResult<()> {
        self.phys.put_long(offset, value)
    }

    fn clear_phys(&mut self, start: u64, end: u64) -> StoreResult<()> {
        self.phys.clear(start, end)
    }
}

impl CommitStrategy for DirectCommit {
    const NAME: &'static str = "direct";

    fn open(
        index: Box<dyn Volume>,
        phys: Box<dyn Volume>,
        config: &StoreConfig,
    ) -> StoreResult<Self> {
        Ok(Self {
            index,
            phys,
            sync_on_commit: config.sync_on_commit,
        })
    }

    fn eager_counters(&self) -> bool {
        true
    }

    fn has_uncommitted(&self) -> bool {
        false
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.sync_on_commit {
            self.sync()?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        Err(StoreError::Unsupported(
            "rollback requires a write-ahead log; this store writes directly".into(),
        ))
    }

    fn can_rollback(&self) -> bool {
        false
    }

    fn sync(&self) -> StoreResult<()> {
        if self.index.is_read_only() {
            return Ok(());
        }
        self.index.sync()?;
        self.phys.sync()
    }

    fn close(&mut self, delete_files: bool) -> StoreResult<()> {
        self.sync()?;
        if delete_files {
            debug!("Deleting store files");
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
