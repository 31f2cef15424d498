//! Heap-backed volume for temporary and test stores.

use std::path::Path;

use tracing::debug;

use super::{Volume, for_each_slice, grown_slice_count, out_of_bounds};
use crate::error::StoreResult;

/// Volatile volume made of zero-filled heap slices.
pub struct MemoryVolume {
    slices: Vec<Box<[u8]>>,
    slice_shift: u32,
}

impl MemoryVolume {
    pub fn new(slice_shift: u32) -> Self {
        Self {
            slices: Vec::new(),
            slice_shift,
        }
    }

    fn slice_size(&self) -> usize {
        1usize << self.slice_shift
    }
}

impl Volume for MemoryVolume {
    fn ensure_available(&mut self, offset: u64) -> StoreResult<()> {
        let needed = offset.div_ceil(self.slice_size() as u64) as usize;
        if needed <= self.slices.len() {
            return Ok(());
        }
        let target = grown_slice_count(self.slices.len(), needed, self.slice_shift);
        debug!(from = self.slices.len(), to = target, "Growing memory volume");
        let size = self.slice_size();
        self.slices.resize_with(target, || vec![0u8; size].into_boxed_slice());
        Ok(())
    }

    fn get_data(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()> {
        if offset + buf.len() as u64 > self.length() {
            return Err(out_of_bounds(offset, buf.len(), self.length()));
        }
        for_each_slice(offset, buf.len(), self.slice_shift, |slice, pos, range| {
            let len = range.len();
            buf[range].copy_from_slice(&self.slices[slice][pos..pos + len]);
            Ok(())
        })
    }

    fn put_data(&mut self, offset: u64, data: &[u8]) -> StoreResult<()> {
        if offset + data.len() as u64 > self.length() {
            return Err(out_of_bounds(offset, data.len(), self.length()));
        }
        let slices = &mut self.slices;
        for_each_slice(offset, data.len(), self.slice_shift, |slice, pos, range| {
            let len = range.len();
            slices[slice][pos..pos + len].copy_from_slice(&data[range]);
            Ok(())
        })
    }

    fn length(&self) -> u64 {
        (self.slices.len() as u64) << self.slice_shift
    }

    fn sync(&self) -> StoreResult<()> {
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> StoreResult<()> {
        let keep = size.div_ceil(self.slice_size() as u64) as usize;
        if keep < self.slices.len() {
            self.slices.truncate(keep);
        } else {
            self.ensure_available(size)?;
        }
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        self.slices.clear();
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_slices_are_zeroed() {
        let mut vol = MemoryVolume::new(12);
        assert_eq!(vol.length(), 0);
        vol.ensure_available(1).unwrap();
        assert_eq!(vol.length(), 4096);
        assert_eq!(vol.get_long(4088).unwrap(), 0);
    }

    #[test]
    fn test_truncate_drops_slices() {
        let mut vol = MemoryVolume::new(12);
        vol.ensure_available(5 * 4096).unwrap();
        vol.truncate(4096).unwrap();
        assert_eq!(vol.length(), 4096);
        assert!(vol.get_byte(4096).is_err());
    }
}
