//! xxHash64 and a word-sized hash derived from it.

use twox_hash::XxHash64;

/// Compute the XXH64 digest of `data` with the given seed.
#[inline]
pub fn xxhash64(data: &[u8], seed: u64) -> u64 {
    XxHash64::oneshot(seed, data)
}

/// Hash a single 64-bit word (XXH64 of its big-endian bytes).
#[inline]
pub fn long_hash(value: u64) -> u64 {
    xxhash64(&value.to_be_bytes(), 0)
}
