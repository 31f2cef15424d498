//! Plain random-access file volume. Every access seeks; nothing is buffered.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use super::{MAX_GROWTH_STEP, Volume, out_of_bounds};
use crate::error::{StoreError, StoreResult};

pub struct FileVolume {
    path: PathBuf,
    file: Option<Mutex<File>>,
    size: u64,
    slice_shift: u32,
    read_only: bool,
}

impl FileVolume {
    /// Create or open the file at `path`.
    pub fn open(path: &Path, slice_shift: u32, read_only: bool) -> StoreResult<Self> {
        if !read_only
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(Mutex::new(file)),
            size,
            slice_shift,
            read_only,
        })
    }

    fn file(&self) -> StoreResult<&Mutex<File>> {
        self.file.as_ref().ok_or(StoreError::Closed)
    }

    fn writable(&self) -> StoreResult<&Mutex<File>> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.file()
    }
}

impl Volume for FileVolume {
    fn ensure_available(&mut self, offset: u64) -> StoreResult<()> {
        if offset <= self.size {
            return Ok(());
        }
        let step = 1u64 << self.slice_shift;
        let doubled = self.size + self.size.min(MAX_GROWTH_STEP);
        let new_size = offset.max(doubled).next_multiple_of(step);
        debug!(path = %self.path.display(), from = self.size, to = new_size, "Growing file volume");
        self.writable()?.lock().set_len(new_size)?;
        self.size = new_size;
        Ok(())
    }

    fn get_data(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        if offset + buf.len() as u64 > self.size {
            return Err(out_of_bounds(offset, buf.len(), self.size));
        }
        let mut file = self.file()?.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn put_data(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        if offset + data.len() as u64 > self.size {
            return Err(out_of_bounds(offset, data.len(), self.size));
        }
        let mut file = self.writable()?.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.size
    }

    fn sync(&self) -> StoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.file()?.lock().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> StoreResult<()> {
        self.writable()?.lock().set_len(size)?;
        self.size = size;
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        if let Some(file) = self.file.take()
            && !self.read_only
        {
            file.lock().sync_all()?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
