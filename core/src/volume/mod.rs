//! Addressable byte storage backing the index, physical and log areas.
//!
//! Every volume is a flat, growable byte range. Slice-based implementations
//! split it into fixed `1 << slice_shift` byte slices so growth never has to
//! remap or copy what is already there; bulk transfers that straddle a slice
//! boundary are split transparently.

mod file;
mod mapped;
mod memory;

pub use file::FileVolume;
pub use mapped::MappedFileVolume;
pub use memory::MemoryVolume;

use std::ops::Range;
use std::path::Path;

use crate::config::VolumeKind;
use crate::error::{StoreError, StoreResult};

/// Default slice size is 1 MiB.
pub const DEFAULT_SLICE_SHIFT: u32 = 20;

/// Upper bound of a single growth step once a volume is large.
pub(crate) const MAX_GROWTH_STEP: u64 = 64 * 1024 * 1024;

/// Byte storage with fixed-width big-endian accessors.
///
/// Reads past [`Volume::length`] are reported as corruption: callers only ever
/// address bytes they previously made available.
pub trait Volume: Send + Sync {
    /// Make sure bytes `[0, offset)` are addressable, growing the backing storage.
    fn ensure_available(&mut self, offset: u64) -> StoreResult<()>;

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    fn get_data(&self, offset: u64, buf: &mut [u8]) -> StoreResult<()>;

    /// Write `data` at `offset`; the range must already be available.
    fn put_data(&mut self, offset: u64, data: &[u8]) -> StoreResult<()>;

    /// Currently addressable size in bytes.
    fn length(&self) -> u64;

    /// Force written data to durable storage.
    fn sync(&self) -> StoreResult<()>;

    /// Shrink (or grow) the backing storage to `size` bytes.
    fn truncate(&mut self, size: u64) -> StoreResult<()>;

    /// Release the backing storage. Further access fails.
    fn close(&mut self) -> StoreResult<()>;

    /// Backing file, if any.
    fn path(&self) -> Option<&Path>;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Close and remove the backing file.
    fn delete_file(&mut self) -> StoreResult<()> {
        self.close()?;
        if let Some(path) = self.path() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn get_long(&self, offset: u64) -> StoreResult<u64> {
        let mut buf = [0u8; 8];
        self.get_data(offset, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn put_long(&mut self, offset: u64, value: u64) -> StoreResult<()> {
        self.put_data(offset, &value.to_be_bytes())
    }

    fn get_int(&self, offset: u64) -> StoreResult<u32> {
        let mut buf = [0u8; 4];
        self.get_data(offset, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn put_int(&mut self, offset: u64, value: u32) -> StoreResult<()> {
        self.put_data(offset, &value.to_be_bytes())
    }

    fn get_byte(&self, offset: u64) -> StoreResult<u8> {
        let mut buf = [0u8; 1];
        self.get_data(offset, &mut buf)?;
        Ok(buf[0])
    }

    fn put_byte(&mut self, offset: u64, value: u8) -> StoreResult<()> {
        self.put_data(offset, &[value])
    }

    fn get_six_long(&self, offset: u64) -> StoreResult<u64> {
        let mut buf = [0u8; 8];
        self.get_data(offset, &mut buf[2..])?;
        Ok(u64::from_be_bytes(buf))
    }

    fn put_six_long(&mut self, offset: u64, value: u64) -> StoreResult<()> {
        debug_assert_eq!(value >> 48, 0, "six-byte long overflow");
        self.put_data(offset, &value.to_be_bytes()[2..])
    }

    /// Zero the byte range `[start, end)`.
    fn clear(&mut self, start: u64, end: u64) -> StoreResult<()> {
        const ZEROS: [u8; 4096] = [0u8; 4096];
        let mut pos = start;
        while pos < end {
            let n = ((end - pos) as usize).min(ZEROS.len());
            self.put_data(pos, &ZEROS[..n])?;
            pos += n as u64;
        }
        Ok(())
    }
}

/// Open a volume of the requested kind.
///
/// `path` is ignored for memory volumes and required for the file kinds.
pub fn open_volume(
    kind: VolumeKind,
    path: Option<&Path>,
    slice_shift: u32,
    read_only: bool,
) -> StoreResult<Box<dyn Volume>> {
    let need_path = || {
        path.ok_or_else(|| StoreError::Config(format!("{kind:?} volume requires a path")))
    };
    Ok(match kind {
        VolumeKind::Memory => Box::new(MemoryVolume::new(slice_shift)),
        VolumeKind::File => Box::new(FileVolume::open(need_path()?, slice_shift, read_only)?),
        VolumeKind::MappedFile => {
            Box::new(MappedFileVolume::open(need_path()?, slice_shift, read_only)?)
        }
    })
}

/// Split `[offset, offset + len)` at slice boundaries.
///
/// Calls `f(slice_index, position_in_slice, range_in_buffer)` for each piece.
pub(crate) fn for_each_slice<F>(offset: u64, len: usize, slice_shift: u32, mut f: F) -> StoreResult<()>
where
    F: FnMut(usize, usize, Range<usize>) -> StoreResult<()>,
{
    let slice_size = 1usize << slice_shift;
    let mask = slice_size as u64 - 1;
    let mut done = 0;
    while done < len {
        let pos = offset + done as u64;
        let slice = (pos >> slice_shift) as usize;
        let in_slice = (pos & mask) as usize;
        let chunk = (slice_size - in_slice).min(len - done);
        f(slice, in_slice, done..done + chunk)?;
        done += chunk;
    }
    Ok(())
}

/// Next slice count when `needed` slices must exist and `current` already do.
pub(crate) fn grown_slice_count(current: usize, needed: usize, slice_shift: u32) -> usize {
    let max_step = ((MAX_GROWTH_STEP >> slice_shift) as usize).max(1);
    needed.max(current + current.min(max_step))
}

pub(crate) fn out_of_bounds(offset: u64, len: usize, length: u64) -> StoreError {
    StoreError::Corrupt(format!(
        "access to [{offset}, {}) beyond end of volume ({length} bytes)",
        offset + len as u64
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(vol: &mut dyn Volume) {
        // Small slices so ranges straddle boundaries.
        vol.ensure_available(3 * 4096 + 100).unwrap();
        assert!(vol.length() >= 3 * 4096 + 100);

        vol.put_long(8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(vol.get_long(8).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(vol.get_byte(8).unwrap(), 0x01);

        vol.put_int(4092, 0xCAFE_BABE).unwrap();
        assert_eq!(vol.get_int(4092).unwrap(), 0xCAFE_BABE);

        vol.put_six_long(8190, 0x1122_3344_5566).unwrap();
        assert_eq!(vol.get_six_long(8190).unwrap(), 0x1122_3344_5566);

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        vol.put_data(1000, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        vol.get_data(1000, &mut back).unwrap();
        assert_eq!(back, data);

        vol.clear(1000, 1000 + data.len() as u64).unwrap();
        vol.get_data(1000, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));

        let end = vol.length();
        assert!(vol.get_long(end - 4).is_err());
        vol.sync().unwrap();
    }

    #[test]
    fn test_memory_volume() {
        let mut vol = MemoryVolume::new(12);
        exercise(&mut vol);
    }

    #[test]
    fn test_file_volume() {
        let dir = tempdir().unwrap();
        let mut vol = FileVolume::open(&dir.path().join("vol.f"), 12, false).unwrap();
        exercise(&mut vol);
    }

    #[test]
    fn test_mapped_volume() {
        let dir = tempdir().unwrap();
        let mut vol = MappedFileVolume::open(&dir.path().join("vol.m"), 12, false).unwrap();
        exercise(&mut vol);
    }

    #[test]
    fn test_file_kinds_persist() {
        let dir = tempdir().unwrap();
        for kind in [VolumeKind::File, VolumeKind::MappedFile] {
            let path = dir.path().join(format!("{kind:?}"));
            {
                let mut vol = open_volume(kind, Some(&path), 12, false).unwrap();
                vol.ensure_available(64).unwrap();
                vol.put_long(16, 42).unwrap();
                vol.sync().unwrap();
                vol.close().unwrap();
            }
            let vol = open_volume(kind, Some(&path), 12, true).unwrap();
            assert!(vol.is_read_only());
            assert_eq!(vol.get_long(16).unwrap(), 42);
        }
    }

    #[test]
    fn test_delete_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        let mut vol = open_volume(VolumeKind::File, Some(&path), 12, false).unwrap();
        vol.ensure_available(8).unwrap();
        assert!(path.exists());
        vol.delete_file().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_file_kind_requires_path() {
        assert!(matches!(
            open_volume(VolumeKind::File, None, 12, false),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_growth_is_geometric() {
        assert_eq!(grown_slice_count(0, 1, 20), 1);
        assert_eq!(grown_slice_count(4, 5, 20), 8);
        assert_eq!(grown_slice_count(4, 20, 20), 20);
        // capped at MAX_GROWTH_STEP worth of slices
        assert_eq!(grown_slice_count(1000, 1001, 20), 1064);
    }
}
