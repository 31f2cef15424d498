//! recstore - embedded record store
//!
//! Maps stable 64-bit recids onto variable-length byte payloads kept in
//! paged volumes, with free-space reuse, a write-ahead log for atomic
//! commits and an append-only alternative engine.

pub mod append;
pub mod async_write;
pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod pack;
pub mod serializer;
pub mod store;
pub mod volume;

#[cfg(test)]
mod tests;

use std::sync::Arc;

pub use append::{AppendStats, StoreAppend};
pub use async_write::AsyncWriteEngine;
pub use config::{AsyncWriteConfig, EngineKind, HeaderPolicy, StoreConfig, VolumeKind};
pub use engine::{CasCheck, Engine, EngineExt, RECID_FIRST, Recid};
pub use error::{StoreError, StoreResult};
pub use serializer::{
    BincodeSerializer, BytesSerializer, PackedU64Serializer, Serializer, StringSerializer,
};
pub use store::{Location, Store, StoreDirect, StoreStats, StoreWal};
pub use volume::Volume;

/// Open the engine `config` selects, wrapped in the write-behind decorator
/// when `async_write` is set.
pub fn open_engine(config: &StoreConfig) -> StoreResult<Box<dyn Engine>> {
    let engine: Box<dyn Engine> = match config.engine {
        EngineKind::Direct => Box::new(StoreDirect::open(config)?),
        EngineKind::Wal => Box::new(StoreWal::open(config)?),
        EngineKind::AppendOnly => Box::new(StoreAppend::open(config)?),
    };
    match &config.async_write {
        Some(async_config) => Ok(Box::new(AsyncWriteEngine::new(
            Arc::from(engine),
            async_config,
        )?)),
        None => Ok(engine),
    }
}
