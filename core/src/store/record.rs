//! Reading, writing and freeing record payloads, including linked records.
//!
//! A payload above [`MAX_REC_SIZE`] is split into chunks and written tail
//! first, so each chunk's link to its successor is known when it is written:
//!
//! ```text
//! head:   [link -> middle][parity16(total << 16)][data ...]
//! middle: [link -> tail  ][data ...]
//! tail:   [data ...]
//! ```

use std::collections::HashSet;

use super::alloc::PagedAllocator;
use super::format::{
    ChunkLink, ChunkRef, HEAD_HEADER_SIZE, IndexWord, LINK_SIZE, Location, MAX_REC_SIZE, MLINKED,
    MIDDLE_CHUNK_DATA, plan_chunks,
};
use super::strategy::StoreIo;
use crate::error::{StoreError, StoreResult};
use crate::pack::{parity16_get, parity16_set};

/// Allocate space for `data`, write it, and return the index word describing it.
pub(crate) fn write_record<I: StoreIo>(
    alloc: &mut PagedAllocator,
    io: &mut I,
    data: &[u8],
) -> StoreResult<IndexWord> {
    if data.is_empty() {
        return Ok(IndexWord::empty());
    }
    if data.len() <= MAX_REC_SIZE {
        let offset = alloc.alloc_slot(io, data.len() as u64)?;
        io.write_phys(offset, data)?;
        return Ok(IndexWord::new(data.len(), offset, 0));
    }

    let parts = plan_chunks(data.len());
    let mut ends = Vec::with_capacity(parts.len());
    let mut end = data.len();
    for &len in parts.iter().rev() {
        ends.push(end);
        end -= len;
    }
    ends.reverse();

    // tail
    let tail_len = parts[parts.len() - 1];
    let tail_data = &data[data.len() - tail_len..];
    let tail = alloc.alloc_slot(io, tail_len as u64)?;
    io.write_phys(tail, tail_data)?;
    let mut next = ChunkLink {
        size: tail_len as u64,
        offset: tail,
        has_next: false,
    };

    // middles, back to front
    for i in (1..parts.len() - 1).rev() {
        let chunk_data = &data[ends[i] - parts[i]..ends[i]];
        let mut buf = Vec::with_capacity(LINK_SIZE + chunk_data.len());
        buf.extend_from_slice(&next.encode().to_be_bytes());
        buf.extend_from_slice(chunk_data);
        let offset = alloc.alloc_slot(io, buf.len() as u64)?;
        io.write_phys(offset, &buf)?;
        next = ChunkLink {
            size: buf.len() as u64,
            offset,
            has_next: true,
        };
    }

    // head
    let head_data = &data[..parts[0]];
    let mut buf = Vec::with_capacity(HEAD_HEADER_SIZE + head_data.len());
    buf.extend_from_slice(&next.encode().to_be_bytes());
    buf.extend_from_slice(&parity16_set((data.len() as u64) << 16).to_be_bytes());
    buf.extend_from_slice(head_data);
    let head = alloc.alloc_slot(io, buf.len() as u64)?;
    io.write_phys(head, &buf)?;
    Ok(IndexWord::new(buf.len(), head, MLINKED))
}

/// Total payload length recorded in a linked record's head chunk.
fn linked_total<I: StoreIo + ?Sized>(io: &I, head: u64) -> StoreResult<u64> {
    let raw = io.phys_long(head + LINK_SIZE as u64)?;
    let total = parity16_get(raw).map_err(|e| e.at(head + LINK_SIZE as u64))? >> 16;
    if total <= MAX_REC_SIZE as u64 {
        return Err(StoreError::Corrupt(format!(
            "linked record at {head} claims only {total} bytes"
        )));
    }
    Ok(total)
}

fn read_link<I: StoreIo + ?Sized>(io: &I, chunk: u64) -> StoreResult<ChunkLink> {
    ChunkLink::decode(io.phys_long(chunk)?).map_err(|e| e.at(chunk))
}

/// Physical chunks of the record described by `word`, head first.
pub(crate) fn locate<I: StoreIo + ?Sized>(io: &I, word: &IndexWord) -> StoreResult<Location> {
    if !word.is_linked() {
        return Ok(Location::Single {
            offset: word.offset,
            size: word.size,
        });
    }

    let total = linked_total(io, word.offset)?;
    let max_chunks = total / MIDDLE_CHUNK_DATA as u64 + 2;
    let mut chunks = vec![ChunkRef {
        offset: word.offset,
        size: word.size,
    }];
    let mut link = read_link(io, word.offset)?;
    loop {
        chunks.push(ChunkRef {
            offset: link.offset,
            size: link.size,
        });
        if chunks.len() as u64 > max_chunks {
            return Err(StoreError::Corrupt(format!(
                "linked record at {} has too many chunks",
                word.offset
            )));
        }
        if !link.has_next {
            break;
        }
        link = read_link(io, link.offset)?;
    }
    Ok(Location::Chain(chunks))
}

/// Read the full payload described by `word`.
pub(crate) fn read_record<I: StoreIo + ?Sized>(io: &I, word: &IndexWord) -> StoreResult<Vec<u8>> {
    if word.size == 0 {
        return Ok(Vec::new());
    }
    if !word.is_linked() {
        let mut buf = vec![0u8; word.size as usize];
        io.read_phys(word.offset, &mut buf)?;
        return Ok(buf);
    }

    let mut chunk = vec![0u8; word.size as usize];
    io.read_phys(word.offset, &mut chunk)?;
    if chunk.len() < HEAD_HEADER_SIZE {
        return Err(StoreError::Corrupt(format!(
            "linked record head at {} too short",
            word.offset
        )));
    }
    let total = linked_total(io, word.offset)? as usize;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&chunk[HEAD_HEADER_SIZE..]);

    let mut seen = HashSet::new();
    let mut link = read_link(io, word.offset)?;
    loop {
        if !seen.insert(link.offset) {
            return Err(StoreError::Corrupt(format!(
                "linked record at {} loops",
                word.offset
            )));
        }
        if link.has_next && link.size <= LINK_SIZE as u64 {
            return Err(StoreError::Corrupt(format!(
                "chunk at {} too short for a link",
                link.offset
            )));
        }
        chunk.resize(link.size as usize, 0);
        io.read_phys(link.offset, &mut chunk)?;
        if !link.has_next {
            out.extend_from_slice(&chunk);
            break;
        }
        let next = ChunkLink::decode(u64::from_be_bytes(
            chunk[..LINK_SIZE]
                .try_into()
                .map_err(|_| StoreError::Corrupt("short chunk".into()))?,
        ))
        .map_err(|e| e.at(link.offset))?;
        out.extend_from_slice(&chunk[LINK_SIZE..]);
        if out.len() > total {
            break;
        }
        link = next;
    }

    if out.len() != total {
        return Err(StoreError::Corrupt(format!(
            "linked record at {} holds {} bytes, head says {total}",
            word.offset,
            out.len()
        )));
    }
    Ok(out)
}

/// Return every slot of the record described by `word` to the free pool.
pub(crate) fn free_record<I: StoreIo>(
    alloc: &mut PagedAllocator,
    io: &mut I,
    word: &IndexWord,
) -> StoreResult<()> {
    if !word.has_slot() {
        return Ok(());
    }
    for chunk in locate(io, word)?.chunks() {
        alloc.free_slot(io, chunk.offset, chunk.size)?;
    }
    Ok(())
}
