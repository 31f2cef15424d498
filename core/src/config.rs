//! Store configuration: TOML file, environment overrides and builder helpers.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::volume::DEFAULT_SLICE_SHIFT;

/// Backing storage for the store's volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    #[default]
    Memory,
    File,
    MappedFile,
}

/// Which record engine to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Direct,
    #[default]
    Wal,
    AppendOnly,
}

impl std::str::FromStr for EngineKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(EngineKind::Direct),
            "wal" => Ok(EngineKind::Wal),
            "append_only" | "append-only" | "append" => Ok(EngineKind::AppendOnly),
            other => Err(StoreError::Config(format!("unknown engine '{other}'"))),
        }
    }
}

/// What to do when a volume's magic header does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPolicy {
    #[default]
    Fail,
    /// Wipe the volume and start a fresh store.
    Reinitialize,
}

/// Write-behind decorator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncWriteConfig {
    /// Bounded queue capacity (default: 1024)
    pub queue_size: usize,
    /// Writer wakes up at least this often (default: 100ms)
    pub flush_interval_ms: u64,
}

impl Default for AsyncWriteConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            flush_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base path of the store files; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    pub volume: VolumeKind,
    pub engine: EngineKind,
    /// Reject every mutating call
    pub read_only: bool,
    /// Remove the backing files when the store is closed
    pub delete_files_on_close: bool,
    /// Volume slice size as a power of two (default: 20, 1 MiB)
    pub slice_shift: u32,
    pub header_policy: HeaderPolicy,
    /// fsync volumes on commit (default: true)
    pub sync_on_commit: bool,
    /// Run contract checks that are otherwise debug assertions
    pub paranoid: bool,
    /// Segment roll-over size for the append-only engine (default: 16MB)
    pub segment_size: u64,
    pub async_write: Option<AsyncWriteConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            volume: VolumeKind::Memory,
            engine: EngineKind::Wal,
            read_only: false,
            delete_files_on_close: false,
            slice_shift: DEFAULT_SLICE_SHIFT,
            header_policy: HeaderPolicy::Fail,
            sync_on_commit: true,
            paranoid: false,
            segment_size: 16 * 1024 * 1024,
            async_write: None,
        }
    }
}

impl StoreConfig {
    /// In-memory store.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Memory-mapped store rooted at `path`.
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            volume: VolumeKind::MappedFile,
            ..Self::default()
        }
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_volume(mut self, volume: VolumeKind) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_delete_files_on_close(mut self, delete: bool) -> Self {
        self.delete_files_on_close = delete;
        self
    }

    pub fn with_slice_shift(mut self, shift: u32) -> Self {
        self.slice_shift = shift;
        self
    }

    pub fn with_header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.header_policy = policy;
        self
    }

    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn with_paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_async_write(mut self, async_write: AsyncWriteConfig) -> Self {
        self.async_write = Some(async_write);
        self
    }

    /// Path of one store file: the base path with `suffix` appended.
    pub fn file_path(&self, suffix: &str) -> Option<PathBuf> {
        self.path.as_ref().map(|base| {
            let mut name = base.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        })
    }

    /// Load config from a TOML file, then apply `RECSTORE_*` environment overrides.
    /// A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let mut cfg = match fs::read_to_string(path.as_ref()) {
            Ok(s) => Self::from_toml(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        cfg.apply_env_overrides(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(s: &str) -> StoreResult<Self> {
        toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> StoreResult<String> {
        toml::to_string(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Apply overrides read through `lookup` (normally the process environment).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> StoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("RECSTORE_PATH") {
            self.path = Some(PathBuf::from(path));
            if self.volume == VolumeKind::Memory {
                self.volume = VolumeKind::MappedFile;
            }
        }

        if let Some(engine) = lookup("RECSTORE_ENGINE") {
            self.engine = engine.parse()?;
        }

        if let Some(v) = lookup("RECSTORE_READ_ONLY") {
            self.read_only = match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(StoreError::Config(format!(
                        "RECSTORE_READ_ONLY: expected a boolean, got '{other}'"
                    )));
                }
            };
        }
        Ok(())
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> StoreResult<()> {
        if !(12..=30).contains(&self.slice_shift) {
            return Err(StoreError::Config(format!(
                "slice_shift must be within 12..=30, got {}",
                self.slice_shift
            )));
        }
        if self.volume != VolumeKind::Memory && self.path.is_none() {
            return Err(StoreError::Config(format!(
                "{:?} volume requires a path",
                self.volume
            )));
        }
        if self.engine == EngineKind::AppendOnly && self.segment_size < 4096 {
            return Err(StoreError::Config(format!(
                "segment_size must be at least 4096 bytes, got {}",
                self.segment_size
            )));
        }
        if self.read_only && self.path.is_none() {
            return Err(StoreError::Config(
                "a read-only store needs existing files to open".into(),
            ));
        }
        if let Some(aw) = &self.async_write {
            if aw.queue_size == 0 {
                return Err(StoreError::Config("async_write.queue_size must be > 0".into()));
            }
            if aw.flush_interval_ms == 0 {
                return Err(StoreError::Config(
                    "async_write.flush_interval_ms must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}
