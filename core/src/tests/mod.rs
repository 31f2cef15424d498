mod engine_tests;
mod wal_tests;

use crate::config::{StoreConfig, VolumeKind};

/// File-backed config with small slices, so tests cross slice boundaries.
pub(crate) fn file_config(dir: &std::path::Path) -> StoreConfig {
    StoreConfig::file(dir.join("store"))
        .with_volume(VolumeKind::File)
        .with_slice_shift(12)
}

/// Deterministic xorshift generator.
pub(crate) struct Rng(u64);

impl Rng {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub(crate) fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub(crate) fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Payload of `len` bytes derived from `seed`.
pub(crate) fn payload(len: usize, seed: u64) -> Vec<u8> {
    (0..len)
        .map(|i| (seed.wrapping_mul(31).wrapping_add(i as u64 * 7) % 251) as u8)
        .collect()
}
