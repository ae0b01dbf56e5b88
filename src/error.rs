//! Error taxonomy for the storage and sync core

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Every way a storage or sync operation can fail.
///
/// Only `Io` is transient; the retry wrapper refuses to retry anything
/// else. `Exhausted` means the retry bound was hit and recovery (partial
/// artifact cleanup) has already run.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient disk failure. Retryable.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// Post-transfer integrity failure. Temp and partial artifacts are
    /// cleaned up before this surfaces.
    #[error("checksum mismatch: expected {expected}, actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Neither a whole file nor chunk parts exist for the name.
    #[error("file not found: {name}")]
    NotFound { name: String },

    /// Empty name, or one that collides with internal artifact suffixes.
    #[error("invalid file name: {name:?}")]
    InvalidName { name: String },

    /// Backing directory missing or not writable. Health signal.
    #[error("storage unavailable: {reason}")]
    Unavailable { reason: String },

    /// The retry bound was hit. Carries the final cause.
    #[error("failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// True only for the transient I/O class the retry wrapper may re-run.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }

    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        StoreError::Unavailable {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_name(name: impl Into<String>) -> Self {
        StoreError::InvalidName { name: name.into() }
    }

    pub(crate) fn not_found(name: impl Into<String>) -> Self {
        StoreError::NotFound { name: name.into() }
    }
}
