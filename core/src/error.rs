use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by volumes, allocators and engines.
///
/// Corruption variants (`Corrupt`, `ChecksumBroken`, `BadHeader`) are fatal: the
/// store never tries to continue past them.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is corrupted: {0}")]
    Corrupt(String),

    #[error("Pointer checksum broken at offset {offset} ({what})")]
    ChecksumBroken { offset: u64, what: &'static str },

    #[error("Bad {what} header: found {found:#018x}")]
    BadHeader { what: &'static str, found: u64 },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Store is opened read-only")]
    ReadOnly,

    #[error("Store is closed")]
    Closed,

    #[error("Record {0} was deleted")]
    AlreadyDeleted(u64),

    #[error("Invalid recid: {0}")]
    InvalidRecid(u64),

    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Shorthand for a checksum failure raised while decoding a pointer word.
    pub(crate) fn checksum(what: &'static str) -> Self {
        StoreError::ChecksumBroken { offset: 0, what }
    }

    /// Attach the volume offset to a checksum error raised by a pure decoder.
    pub(crate) fn at(self, offset: u64) -> Self {
        match self {
            StoreError::ChecksumBroken { what, .. } => StoreError::ChecksumBroken { offset, what },
            other => other,
        }
    }

    /// True for errors that mean the files can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupt(_) | StoreError::ChecksumBroken { .. } | StoreError::BadHeader { .. }
        )
    }

    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Io(_) => "io_error",
            StoreError::Corrupt(_) => "corrupt",
            StoreError::ChecksumBroken { .. } => "checksum_broken",
            StoreError::BadHeader { .. } => "bad_header",
            StoreError::Unsupported(_) => "unsupported",
            StoreError::ReadOnly => "read_only",
            StoreError::Closed => "closed",
            StoreError::AlreadyDeleted(_) => "already_deleted",
            StoreError::InvalidRecid(_) => "invalid_recid",
            StoreError::RecordTooLarge { .. } => "record_too_large",
            StoreError::Serialization(_) => "serialization_error",
            StoreError::InvalidInput(_) => "invalid_input",
            StoreError::Config(_) => "config_error",
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
