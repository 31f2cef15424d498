//! Paged LIFO of 64-bit values embedded in the physical area.
//!
//! Page layout:
//!
//! ```text
//! +------------------------------+----------+----------+-----+-------
//! | parity4(page_size<<48 | prev) | value #1 | value #2 | ... | zeros
//! +------------------------------+----------+----------+-----+-------
//! ```
//!
//! Values are bidirectional varints of `parity1(value << 1)`, so the top of a
//! page can be popped from its tail and a page's tail can be rediscovered by
//! scanning backward for the last non-zero byte. The master link in the index
//! header holds `parity4(tail << 48 | page)` for the newest page, or 0.
//!
//! Pages are allocated through the same allocator the stacks serve. An
//! allocation may push onto or pop from the stack being modified, so the
//! master link is re-read after every allocation.

use std::collections::HashSet;

use super::alloc::PagedAllocator;
use super::format::ChunkRef;
use super::strategy::StoreIo;
use crate::error::{StoreError, StoreResult};
use crate::pack::{
    MAX_PACKED_LONG, pack_long_bidi, parity1_get, parity1_set, parity4_get, parity4_set,
    round_up_16, unpack_long_bidi, unpack_long_bidi_reverse,
};

pub const LONG_STACK_MIN_PAGE: u64 = 160;
pub const LONG_STACK_MAX_PAGE: u64 = 4096;
const PAGE_HEADER: u64 = 8;
const OFFSET_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Size of the page that follows one of `size` bytes.
pub fn next_page_size(size: u64) -> u64 {
    round_up_16(size * 2).min(LONG_STACK_MAX_PAGE)
}

/// Decoded master link: `(tail, page)`, `(0, 0)` when the stack is empty.
fn read_master<I: StoreIo + ?Sized>(io: &I, master: u64) -> StoreResult<(u64, u64)> {
    let raw = io.index_long(master)?;
    if raw == 0 {
        return Ok((0, 0));
    }
    let link = parity4_get(raw).map_err(|e| e.at(master))?;
    let (tail, page) = (link >> 48, link & OFFSET_MASK);
    if page == 0 || tail <= PAGE_HEADER {
        return Err(StoreError::Corrupt(format!(
            "master link at {master} points to an empty page"
        )));
    }
    Ok((tail, page))
}

fn write_master<I: StoreIo>(io: &mut I, master: u64, tail: u64, page: u64) -> StoreResult<()> {
    let raw = if page == 0 {
        0
    } else {
        parity4_set((tail << 48) | page)
    };
    io.put_index_long(master, raw)
}

/// Page header: `(page_size, prev_page)`.
fn read_page_header<I: StoreIo + ?Sized>(io: &I, page: u64) -> StoreResult<(u64, u64)> {
    let header = parity4_get(io.phys_long(page)?).map_err(|e| e.at(page))?;
    let size = header >> 48;
    if !(LONG_STACK_MIN_PAGE..=LONG_STACK_MAX_PAGE).contains(&size) || size % 16 != 0 {
        return Err(StoreError::Corrupt(format!(
            "long stack page at {page} has bad size {size}"
        )));
    }
    Ok((size, header & OFFSET_MASK))
}

/// Read page content `[PAGE_HEADER, size)`.
fn read_page_body<I: StoreIo + ?Sized>(io: &I, page: u64, size: u64) -> StoreResult<Vec<u8>> {
    let mut body = vec![0u8; (size - PAGE_HEADER) as usize];
    io.read_phys(page + PAGE_HEADER, &mut body)?;
    Ok(body)
}

/// Tail of a page: one past its last non-zero byte.
fn find_tail(body: &[u8], page: u64) -> StoreResult<u64> {
    match body.iter().rposition(|&b| b != 0) {
        Some(pos) => Ok(PAGE_HEADER + pos as u64 + 1),
        None => Err(StoreError::Corrupt(format!(
            "long stack page at {page} is empty but still linked"
        ))),
    }
}

fn decode_value(encoded: u64, at: u64) -> StoreResult<u64> {
    Ok(parity1_get(encoded).map_err(|e| e.at(at))? >> 1)
}

impl PagedAllocator {
    /// Push `value` (non-zero, below 2^63) onto the stack at `master`.
    pub(crate) fn long_stack_put<I: StoreIo>(
        &mut self,
        io: &mut I,
        master: u64,
        value: u64,
    ) -> StoreResult<()> {
        debug_assert!(value != 0 && value >> 63 == 0, "long stack value {value}");
        let mut buf = [0u8; MAX_PACKED_LONG];
        let len = pack_long_bidi(&mut buf, parity1_set(value << 1)) as u64;
        let encoded = &buf[..len as usize];

        let (tail, page) = read_master(io, master)?;
        let new_size = if page == 0 {
            LONG_STACK_MIN_PAGE
        } else {
            let (size, _) = read_page_header(io, page)?;
            if tail + len <= size {
                io.write_phys(page + tail, encoded)?;
                return write_master(io, master, tail + len, page);
            }
            next_page_size(size)
        };

        let new_page = self.alloc_slot(io, new_size)?;
        let (_, prev) = read_master(io, master)?;

        io.clear_phys(new_page, new_page + new_size)?;
        io.put_phys_long(new_page, parity4_set((new_size << 48) | prev))?;
        io.write_phys(new_page + PAGE_HEADER, encoded)?;
        write_master(io, master, PAGE_HEADER + len, new_page)
    }

    /// Pop the newest value from the stack at `master`; 0 if it is empty.
    pub(crate) fn long_stack_take<I: StoreIo>(&mut self, io: &mut I, master: u64) -> StoreResult<u64> {
        let (tail, page) = read_master(io, master)?;
        if page == 0 {
            return Ok(0);
        }

        let start = tail.saturating_sub(MAX_PACKED_LONG as u64).max(PAGE_HEADER);
        let mut buf = vec![0u8; (tail - start) as usize];
        io.read_phys(page + start, &mut buf)?;
        let (encoded, len) = unpack_long_bidi_reverse(&buf, buf.len())?;
        let len = len as u64;
        let value = decode_value(encoded, page + tail - len)?;

        let new_tail = tail - len;
        io.clear_phys(page + new_tail, page + tail)?;
        if new_tail > PAGE_HEADER {
            write_master(io, master, new_tail, page)?;
            return Ok(value);
        }

        // Page is empty: fall back to the previous page and recycle this one.
        let (size, prev) = read_page_header(io, page)?;
        if prev == 0 {
            write_master(io, master, 0, 0)?;
        } else {
            let (prev_size, _) = read_page_header(io, prev)?;
            let prev_tail = find_tail(&read_page_body(io, prev, prev_size)?, prev)?;
            write_master(io, master, prev_tail, prev)?;
        }
        io.put_phys_long(page, 0)?;
        self.free_slot(io, page, size)?;
        Ok(value)
    }
}

/// Contents of one long stack, read without modifying it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LongStackContents {
    /// Values from the oldest to the newest.
    pub values: Vec<u64>,
    pub pages: Vec<ChunkRef>,
}

/// Walk every page of the stack at `master`, verifying all checksums.
pub fn long_stack_walk<I: StoreIo + ?Sized>(io: &I, master: u64) -> StoreResult<LongStackContents> {
    let mut contents = LongStackContents::default();
    let (mut tail, mut page) = read_master(io, master)?;
    let mut visited = HashSet::new();

    while page != 0 {
        if !visited.insert(page) {
            return Err(StoreError::Corrupt(format!("long stack at {master} loops")));
        }
        let (size, prev) = read_page_header(io, page)?;
        let body = read_page_body(io, page, size)?;
        if tail > size {
            return Err(StoreError::Corrupt(format!(
                "long stack tail {tail} beyond page size {size} at {page}"
            )));
        }

        let mut page_values = Vec::new();
        let mut pos = 0usize;
        let end = (tail - PAGE_HEADER) as usize;
        while pos < end {
            let (encoded, len) = unpack_long_bidi(&body[..end], pos)?;
            page_values.push(decode_value(encoded, page + PAGE_HEADER + pos as u64)?);
            pos += len;
        }
        if body[end..].iter().any(|&b| b != 0) {
            return Err(StoreError::Corrupt(format!(
                "long stack page at {page} has data past its tail"
            )));
        }

        page_values.reverse();
        contents.values.extend(page_values);
        contents.pages.push(ChunkRef { offset: page, size });

        page = prev;
        if page != 0 {
            let (prev_size, _) = read_page_header(io, page)?;
            tail = find_tail(&read_page_body(io, page, prev_size)?, page)?;
        }
    }

    contents.values.reverse();
    Ok(contents)
}
