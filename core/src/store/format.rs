//! On-disk layout of the index and physical volumes.
//!
//! Index word (one per recid):
//!
//! ```text
//!  63        48 47                                4   3      2      1     0
//! +------------+-----------------------------------+------+------+-----+------+
//! |    size    |       physical offset (>> 4)      |LINKED|UNUSED|NULL |parity|
//! +------------+-----------------------------------+------+------+-----+------+
//! ```
//!
//! A raw word of 0 was never written and reads as absent without a parity check.

use crate::engine::{RECID_LAST_RESERVED, Recid};
use crate::error::{StoreError, StoreResult};
use crate::pack::{parity1_get, parity1_set, parity3_get, parity3_set, round_up_16};

pub const INDEX_HEADER: u64 = u64::from_be_bytes(*b"RSTINDX1");
pub const PHYS_HEADER: u64 = u64::from_be_bytes(*b"RSTPHYS1");

pub const FORMAT_VERSION: u64 = 1;

// Index volume header words
pub const IO_INDEX_SIZE: u64 = 8;
pub const IO_PHYS_SIZE: u64 = 16;
pub const IO_FREE_RECID: u64 = 24;
pub const IO_FEATURES: u64 = 32;
pub const IO_FREE_SLOTS_BASE: u64 = 56;

/// Largest payload a single slot holds.
pub const MAX_REC_SIZE: usize = 65535;
/// Largest slot, in bytes.
pub const MAX_SLOT_SIZE: u64 = 65536;
/// Number of free-slot size classes (class `c` holds `16 * c` byte slots).
pub const SIZE_CLASSES: u64 = MAX_SLOT_SIZE / 16;

pub const INDEX_BASE: u64 = IO_FREE_SLOTS_BASE + 8 * (SIZE_CLASSES + 1);

/// First usable byte of the physical volume.
pub const PHYS_START: u64 = 16;

const OFFSET_MASK: u64 = 0x0000_FFFF_FFFF_FFF0;

pub const MLINKED: u64 = 0x8;
pub const MUNUSED: u64 = 0x4;
pub const MNULL: u64 = 0x2;
const FLAGS_MASK: u64 = MLINKED | MUNUSED | MNULL;

// Linked record chunk capacities
pub const LINK_SIZE: usize = 8;
pub const HEAD_HEADER_SIZE: usize = 16;
pub const HEAD_CHUNK_DATA: usize = MAX_REC_SIZE - HEAD_HEADER_SIZE;
pub const MIDDLE_CHUNK_DATA: usize = MAX_REC_SIZE - LINK_SIZE;

/// Byte offset of the index word for `recid`.
#[inline]
pub fn index_offset(recid: Recid) -> u64 {
    INDEX_BASE + recid * 8
}

/// Recid whose index word ends at `index_size`.
#[inline]
pub fn max_recid(index_size: u64) -> Recid {
    (index_size - INDEX_BASE) / 8 - 1
}

/// Index size of a fresh store: recids `0..=RECID_LAST_RESERVED` exist.
pub const INITIAL_INDEX_SIZE: u64 = INDEX_BASE + (RECID_LAST_RESERVED + 1) * 8;

/// Master link offset of the free-slot stack for `class`.
#[inline]
pub fn free_slot_master(class: u64) -> u64 {
    debug_assert!((1..=SIZE_CLASSES).contains(&class));
    IO_FREE_SLOTS_BASE + class * 8
}

/// Size class of a slot holding `size` bytes.
#[inline]
pub fn size_class(size: u64) -> u64 {
    round_up_16(size) / 16
}

/// Decoded index word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexWord {
    pub size: u64,
    pub offset: u64,
    pub flags: u64,
}

impl IndexWord {
    pub fn new(size: usize, offset: u64, flags: u64) -> Self {
        debug_assert!(size <= MAX_REC_SIZE, "record size {size} exceeds slot");
        debug_assert_eq!(offset & !OFFSET_MASK, 0, "misaligned offset {offset}");
        Self {
            size: size as u64,
            offset,
            flags,
        }
    }

    /// Zero-length record.
    pub fn empty() -> Self {
        Self::new(0, 0, 0)
    }

    /// Recid is allocated but holds no value.
    pub fn null() -> Self {
        Self::new(0, 0, MNULL)
    }

    /// Recid was deleted and waits on the free-recid stack.
    pub fn unused() -> Self {
        Self::new(0, 0, MUNUSED)
    }

    /// Decode with parity verification. `Ok(None)` for a never-written word.
    pub fn decode(raw: u64) -> StoreResult<Option<Self>> {
        if raw == 0 {
            return Ok(None);
        }
        Ok(Some(Self::decode_unchecked(parity1_get(raw)?)))
    }

    /// Decode without checking parity; `raw` may still carry the parity bit.
    pub fn decode_unchecked(raw: u64) -> Self {
        Self {
            size: raw >> 48,
            offset: raw & OFFSET_MASK,
            flags: raw & FLAGS_MASK,
        }
    }

    pub fn encode(&self) -> u64 {
        parity1_set((self.size << 48) | self.offset | self.flags)
    }

    pub fn is_linked(&self) -> bool {
        self.flags & MLINKED != 0
    }

    pub fn is_unused(&self) -> bool {
        self.flags & MUNUSED != 0
    }

    pub fn is_null(&self) -> bool {
        self.flags & MNULL != 0
    }

    /// Holds a payload (possibly zero-length).
    pub fn has_value(&self) -> bool {
        self.flags & (MUNUSED | MNULL) == 0
    }

    /// Occupies physical space.
    pub fn has_slot(&self) -> bool {
        self.has_value() && self.size > 0
    }
}

/// Pointer from one chunk of a linked record to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLink {
    pub size: u64,
    pub offset: u64,
    /// The chunk pointed to carries a link of its own.
    pub has_next: bool,
}

impl ChunkLink {
    pub fn encode(&self) -> u64 {
        let linked = if self.has_next { MLINKED } else { 0 };
        parity3_set((self.size << 48) | self.offset | linked)
    }

    pub fn decode(raw: u64) -> StoreResult<Self> {
        let v = parity3_get(raw)?;
        let link = Self {
            size: v >> 48,
            offset: v & OFFSET_MASK,
            has_next: v & MLINKED != 0,
        };
        if link.offset == 0 || link.size == 0 {
            return Err(StoreError::Corrupt(format!("empty chunk link {raw:#018x}")));
        }
        Ok(link)
    }
}

/// One physical chunk of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkRef {
    pub offset: u64,
    pub size: u64,
}

impl ChunkRef {
    /// Bytes the chunk occupies in the physical volume.
    pub fn extent(&self) -> u64 {
        round_up_16(self.size)
    }
}

/// Where a record's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Single { offset: u64, size: u64 },
    /// Head first, in logical order.
    Chain(Vec<ChunkRef>),
}

impl Location {
    pub fn chunks(&self) -> Vec<ChunkRef> {
        match self {
            Location::Single { size: 0, .. } => Vec::new(),
            Location::Single { offset, size } => vec![ChunkRef {
                offset: *offset,
                size: *size,
            }],
            Location::Chain(chunks) => chunks.clone(),
        }
    }
}

/// Payload bytes carried by each chunk of a linked record of `total` bytes,
/// head first.
pub fn plan_chunks(total: usize) -> Vec<usize> {
    debug_assert!(total > MAX_REC_SIZE);
    let mut parts = vec![HEAD_CHUNK_DATA];
    let mut remaining = total - HEAD_CHUNK_DATA;
    while remaining > MAX_REC_SIZE {
        parts.push(MIDDLE_CHUNK_DATA);
        remaining -= MIDDLE_CHUNK_DATA;
    }
    parts.push(remaining);
    parts
}
