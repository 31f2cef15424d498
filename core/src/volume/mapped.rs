//! Memory-mapped file volume composed of fixed-size slices.
//!
//! Growing the volume extends the file and maps only the new slices; existing
//! mappings are never remapped. Read-only volumes map the file as it is, with
//! the last slice possibly shorter than the rest.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use super::{Volume, for_each_slice, grown_slice_count, out_of_bounds};
use crate::error::{StoreError, StoreResult};

enum Slice {
    Writable(MmapMut),
    ReadOnly(Mmap),
}

impl Slice {
    fn bytes(&self) -> &[u8] {
        match self {
            Slice::Writable(m) => m,
            Slice::ReadOnly(m) => m,
        }
    }
}

pub struct MappedFileVolume {
    path: PathBuf,
    file: Option<File>,
    slices: Vec<Slice>,
    slice_shift: u32,
    length: u64,
    read_only: bool,
}

impl MappedFileVolume {
    pub fn open(path: &Path, slice_shift: u32, read_only: bool) -> StoreResult<Self> {
        if slice_shift < 12 {
            return Err(StoreError::Config(format!(
                "mapped volumes need page-aligned slices, got shift {slice_shift}"
            )));
        }
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
        let file_len = file.metadata()?.len();

        let mut vol = Self {
            path: path.to_path_buf(),
            file: Some(file),
            slices: Vec::new(),
            slice_shift,
            length: 0,
            read_only,
        };

        if read_only {
            vol.map_read_only(file_len)?;
        } else if file_len > 0 {
            // Writable mappings always cover whole slices.
            vol.ensure_available(file_len)?;
        }
        Ok(vol)
    }

    fn slice_size(&self) -> u64 {
        1u64 << self.slice_shift
    }

    fn map_read_only(&mut self, file_len: u64) -> StoreResult<()> {
        let file = self.file.as_ref().ok_or(StoreError::Closed)?;
        let mut offset = 0;
        while offset < file_len {
            let len = (file_len - offset).min(self.slice_size());
            // SAFETY: the store assumes exclusive single-process access to its files.
            let map = unsafe { MmapOptions::new().offset(offset).len(len as usize).map(file)? };
            self.slices.push(Slice::ReadOnly(map));
            offset += len;
        }
        self.length = file_len;
        Ok(())
    }
}

impl Volume for MappedFileVolume {
    fn ensure_available(&mut self, offset: u64) -> StoreResult<()> {
        if offset <= self.length {
            return Ok(());
        }
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let needed = offset.div_ceil(self.slice_size()) as usize;
        let target = grown_slice_count(self.slices.len(), needed, self.slice_shift);
        let slice_size = self.slice_size();
        let file = self.file.as_ref().ok_or(StoreError::Closed)?;

        debug!(path = %self.path.display(), from = self.slices.len(), to = target, "Mapping new slices");
        let new_len = target as u64 * slice_size;
        if file.metadata()?.len() < new_len {
            file.set_len(new_len)?;
        }
        for index in self.slices.len()..target {
            // SAFETY: the store assumes exclusive single-process access to its files.
            let map = unsafe {
                MmapOptions::new()
                    .offset(index as u64 * slice_size)
                    .len(slice_size as usize)
                    .map_mut(file)?
            };
            self.slices.push(Slice::Writable(map));
        }
        self.length = new_len;
        Ok(())
    }

    fn get_data(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        if self.file.is_none() {
            return Err(StoreError::Closed);
        }
        if offset + buf.len() as u64 > self.length {
            return Err(out_of_bounds(offset, buf.len(), self.length));
        }
        for_each_slice(offset, buf.len(), self.slice_shift, |slice, pos, range| {
            let len = range.len();
            buf[range].copy_from_slice(&self.slices[slice].bytes()[pos..pos + len]);
            Ok(())
        })
    }

    fn put_data(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        if self.file.is_none() {
            return Err(StoreError::Closed);
        }
        if offset + data.len() as u64 > self.length {
            return Err(out_of_bounds(offset, data.len(), self.length));
        }
        let slices = &mut self.slices;
        for_each_slice(offset, data.len(), self.slice_shift, |slice, pos, range| {
            let len = range.len();
            match &mut slices[slice] {
                Slice::Writable(map) => map[pos..pos + len].copy_from_slice(&data[range]),
                Slice::ReadOnly(_) => return Err(StoreError::ReadOnly),
            }
            Ok(())
        })
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn sync(&self) -> StoreResult<()> {
        for slice in &self.slices {
            if let Slice::Writable(map) = slice {
                map.flush()?;
            }
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        // Keep whole slices so no mapping ever extends past the end of the file.
        let keep = size.div_ceil(self.slice_size()) as usize;
        if keep >= self.slices.len() {
            return self.ensure_available(size);
        }
        self.sync()?;
        self.slices.truncate(keep);
        self.length = keep as u64 * self.slice_size();
        let file = self.file.as_ref().ok_or(StoreError::Closed)?;
        file.set_len(self.length)?;
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.sync()?;
        self.slices.clear();
        if let Some(file) = self.file.take()
            && !self.read_only
        {
            file.sync_all()?;
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
