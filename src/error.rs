//! Error types for cowvol.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cowvol operations.
pub type Result<T> = std::result::Result<T, CowvolError>;

/// Main error type for cowvol.
#[derive(Error, Debug)]
pub enum CowvolError {
    /// The requested operation or negotiated mode is not supported by this driver.
    #[error("Not supported: {reason}")]
    NotSupported { reason: String },

    /// A volume is still referenced and cannot be unmounted.
    #[error("Volume in use: {volume}")]
    InUse { volume: String },

    /// Shrinking a block file below its current size was requested without
    /// `allow_unsafe_resize`.
    #[error("Block file {path:?} cannot be shrunk")]
    CannotBeShrunk { path: PathBuf },

    /// The target volume already exists.
    #[error("Volume already exists: {volume}")]
    AlreadyExists { volume: String },

    /// A snapshot name failed path-traversal validation.
    #[error("Invalid snapshot name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Quotas are disabled on the pool. Internal signal; callers recover by
    /// enabling quotas and retrying once.
    #[error("Quotas disabled on pool")]
    NoQuota,

    /// No quota group exists for the subvolume. Internal signal; callers
    /// recover by creating one and retrying once.
    #[error("No qgroup for subvolume")]
    NoQgroup,

    /// A size string could not be parsed.
    #[error("Invalid size {value:?}")]
    InvalidSize { value: String },

    /// A pool tool invocation exited non-zero.
    #[error("Command failed: {command}: {stderr}")]
    ToolFailed { command: String, stderr: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CowvolError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }
}
