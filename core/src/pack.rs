//! Binary packing helpers shared by every on-disk structure.
//!
//! * one-way varints: 7-bit groups, least significant first, `0x80` continuation
//! * bidirectional varints: first and last byte flagged with `0x80`, decodable from
//!   either end (used by the long stack, which pops from the tail)
//! * parity words: check bits stored in the low bits of pointer words
//! * fixed-width big-endian integers inside byte slices

use crate::error::{StoreError, StoreResult};
use crate::hash::long_hash;

/// Largest encoding of a u64 in either varint flavour.
pub const MAX_PACKED_LONG: usize = 10;

/// Largest one-way encoding of a u32.
pub const MAX_PACKED_INT: usize = 5;

// One-way varints

/// Append `value` as a one-way varint, returning the number of bytes written.
pub fn pack_long(out: &mut Vec<u8>, mut value: u64) -> usize {
    let mut written = 0;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        written += 1;
        if value == 0 {
            return written;
        }
    }
}

/// Decode a one-way varint, returning `(value, bytes_consumed)`.
pub fn unpack_long(buf: &[u8]) -> StoreResult<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_PACKED_LONG {
            return Err(StoreError::Corrupt("varint too long".into()));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(StoreError::Corrupt("incomplete varint".into()))
}

/// Append `value` as a one-way varint.
pub fn pack_int(out: &mut Vec<u8>, value: u32) -> usize {
    pack_long(out, value as u64)
}

/// Decode a one-way varint that must fit in 32 bits.
pub fn unpack_int(buf: &[u8]) -> StoreResult<(u32, usize)> {
    let (value, len) = unpack_long(&buf[..buf.len().min(MAX_PACKED_INT)])?;
    let value = u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("packed int overflow: {value}")))?;
    Ok((value, len))
}

/// Size of the one-way encoding of `value`.
#[inline]
pub fn packed_long_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

// Bidirectional varints

/// Encode `value` into `buf` as a bidirectional varint (at least two bytes).
pub fn pack_long_bidi(buf: &mut [u8], mut value: u64) -> usize {
    buf[0] = (value & 0x7F) as u8 | 0x80;
    value >>= 7;
    let mut len = 1;
    while value & !0x7F != 0 {
        buf[len] = (value & 0x7F) as u8;
        value >>= 7;
        len += 1;
    }
    buf[len] = value as u8 | 0x80;
    len + 1
}

/// Size of the bidirectional encoding of `value`.
pub fn packed_long_bidi_size(value: u64) -> usize {
    let mut scratch = [0u8; MAX_PACKED_LONG];
    pack_long_bidi(&mut scratch, value)
}

/// Decode a bidirectional varint that starts at `buf[pos]`.
pub fn unpack_long_bidi(buf: &[u8], pos: usize) -> StoreResult<(u64, usize)> {
    let first = *buf
        .get(pos)
        .ok_or_else(|| StoreError::Corrupt("bidi varint past end of buffer".into()))?;
    if first & 0x80 == 0 {
        return Err(StoreError::Corrupt("bidi varint missing start marker".into()));
    }
    let mut result = (first & 0x7F) as u64;
    let mut shift = 7;
    for i in 1..MAX_PACKED_LONG {
        let byte = *buf
            .get(pos + i)
            .ok_or_else(|| StoreError::Corrupt("truncated bidi varint".into()))?;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 != 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(StoreError::Corrupt("bidi varint too long".into()))
}

/// Decode the bidirectional varint whose last byte is `buf[end - 1]`.
pub fn unpack_long_bidi_reverse(buf: &[u8], end: usize) -> StoreResult<(u64, usize)> {
    if end < 2 || end > buf.len() || buf[end - 1] & 0x80 == 0 {
        return Err(StoreError::Corrupt("bidi varint missing end marker".into()));
    }
    let mut start = end - 2;
    loop {
        if buf[start] & 0x80 != 0 {
            break;
        }
        if start == 0 || end - start >= MAX_PACKED_LONG {
            return Err(StoreError::Corrupt("bidi varint missing start marker".into()));
        }
        start -= 1;
    }
    let (value, len) = unpack_long_bidi(buf, start)?;
    if start + len != end {
        return Err(StoreError::Corrupt("bidi varint length mismatch".into()));
    }
    Ok((value, len))
}

// Parity words

#[inline]
pub fn parity1_set(value: u64) -> u64 {
    debug_assert_eq!(value & 1, 0, "parity bit already occupied");
    value | ((value.count_ones() as u64 + 1) % 2)
}

#[inline]
pub fn parity1_get(value: u64) -> StoreResult<u64> {
    let ret = value & !1;
    if (ret.count_ones() as u64 + 1) % 2 != value & 1 {
        return Err(StoreError::checksum("parity1"));
    }
    Ok(ret)
}

#[inline]
pub fn parity3_set(value: u64) -> u64 {
    debug_assert_eq!(value & 0x7, 0, "parity bits already occupied");
    value | ((value.count_ones() as u64 + 1) % 8)
}

#[inline]
pub fn parity3_get(value: u64) -> StoreResult<u64> {
    let ret = value & !0x7;
    if (ret.count_ones() as u64 + 1) % 8 != value & 0x7 {
        return Err(StoreError::checksum("parity3"));
    }
    Ok(ret)
}

#[inline]
pub fn parity4_set(value: u64) -> u64 {
    debug_assert_eq!(value & 0xF, 0, "parity bits already occupied");
    value | ((value.count_ones() as u64 + 1) % 16)
}

#[inline]
pub fn parity4_get(value: u64) -> StoreResult<u64> {
    let ret = value & !0xF;
    if (ret.count_ones() as u64 + 1) % 16 != value & 0xF {
        return Err(StoreError::checksum("parity4"));
    }
    Ok(ret)
}

#[inline]
pub fn parity16_set(value: u64) -> u64 {
    debug_assert_eq!(value & 0xFFFF, 0, "parity bits already occupied");
    value | (long_hash(value) & 0xFFFF)
}

#[inline]
pub fn parity16_get(value: u64) -> StoreResult<u64> {
    let ret = value & !0xFFFF;
    if long_hash(ret) & 0xFFFF != value & 0xFFFF {
        return Err(StoreError::checksum("parity16"));
    }
    Ok(ret)
}

// Fixed-width big-endian helpers

#[inline]
pub fn put_long(buf: &mut [u8], pos: usize, value: u64) {
    buf[pos..pos + 8].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_long(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_be_bytes(bytes)
}

#[inline]
pub fn put_int(buf: &mut [u8], pos: usize, value: u32) {
    buf[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_int(buf: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_be_bytes(bytes)
}

/// Write the low 48 bits of `value`.
#[inline]
pub fn put_six_long(buf: &mut [u8], pos: usize, value: u64) {
    debug_assert_eq!(value >> 48, 0, "six-byte long overflow");
    buf[pos..pos + 6].copy_from_slice(&value.to_be_bytes()[2..]);
}

#[inline]
pub fn get_six_long(buf: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[2..].copy_from_slice(&buf[pos..pos + 6]);
    u64::from_be_bytes(bytes)
}

/// Round up to the next multiple of 16.
#[inline]
pub fn round_up_16(value: u64) -> u64 {
    (value + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            let len = pack_long(&mut buf, value);
            assert_eq!(len, buf.len());
            assert_eq!(len, packed_long_size(value));
            assert_eq!(unpack_long(&buf).unwrap(), (value, len));
        }
    }

    #[test]
    fn test_varint_is_least_significant_first() {
        let mut buf = Vec::new();
        pack_long(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);
    }

    #[test]
    fn test_unpack_int_rejects_overflow() {
        let mut buf = Vec::new();
        pack_long(&mut buf, u32::MAX as u64 + 1);
        assert!(unpack_int(&buf).is_err());
        assert!(unpack_long(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn test_bidi_both_directions() {
        let values = [0u64, 5, 127, 128, 1 << 20, (1 << 44) - 16, u64::MAX];
        let mut buf = vec![0u8; 3];
        let mut ends = Vec::new();
        for &v in &values {
            let mut scratch = [0u8; MAX_PACKED_LONG];
            let len = pack_long_bidi(&mut scratch, v);
            assert!(len >= 2);
            assert_eq!(len, packed_long_bidi_size(v));
            assert_ne!(scratch[0], 0);
            assert_ne!(scratch[len - 1], 0);
            buf.extend_from_slice(&scratch[..len]);
            ends.push(buf.len());
        }

        // forward
        let mut pos = 3;
        for &v in &values {
            let (value, len) = unpack_long_bidi(&buf, pos).unwrap();
            assert_eq!(value, v);
            pos += len;
        }

        // backward
        let mut end = buf.len();
        for (&v, &expected_end) in values.iter().zip(ends.iter()).rev() {
            assert_eq!(end, expected_end);
            let (value, len) = unpack_long_bidi_reverse(&buf, end).unwrap();
            assert_eq!(value, v);
            end -= len;
        }
        assert_eq!(end, 3);
    }

    #[test]
    fn test_parity_detects_single_bit_flip() {
        let word = 0x0012_3456_7890_0000u64;
        let checks: [(fn(u64) -> u64, fn(u64) -> StoreResult<u64>); 4] = [
            (parity1_set, parity1_get),
            (parity3_set, parity3_get),
            (parity4_set, parity4_get),
            (parity16_set, parity16_get),
        ];
        for (set, get) in checks {
            let sealed = set(word);
            assert_eq!(get(sealed).unwrap(), word);
            for bit in 20..60 {
                assert!(get(sealed ^ (1 << bit)).is_err(), "flip of bit {bit} unnoticed");
            }
        }
    }

    #[test]
    fn test_parity_of_zero_is_never_zero() {
        assert_ne!(parity1_set(0), 0);
        assert_ne!(parity3_set(0), 0);
        assert_ne!(parity4_set(0), 0);
        assert!(parity1_get(0).is_err());
        assert!(parity4_get(0).is_err());
    }

    #[test]
    fn test_fixed_width_helpers() {
        let mut buf = [0u8; 16];
        put_long(&mut buf, 0, 0x0102_0304_0506_0708);
        assert_eq!(buf[0], 0x01);
        assert_eq!(get_long(&buf, 0), 0x0102_0304_0506_0708);

        put_six_long(&mut buf, 8, 0xAABB_CCDD_EEFF);
        assert_eq!(get_six_long(&buf, 8), 0xAABB_CCDD_EEFF);
        assert_eq!(buf[14], 0);

        put_int(&mut buf, 0, 0xDEAD_BEEF);
        assert_eq!(get_int(&buf, 0), 0xDEAD_BEEF);
        assert_eq!(round_up_16(1), 16);
        assert_eq!(round_up_16(32), 32);
    }
}
