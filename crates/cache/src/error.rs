//! Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Underlying I/O and database errors are kept as children
//! in the error tree rather than folded into the kind.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No cache entry (or no cached file) for the resource.
    #[display("not in cache: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Not valid for the entry's current state, e.g. clearing the dirty flag of
    /// a clean file or unmounting a file that isn't mounted.
    #[display("invalid cache operation: {_0}")]
    InvalidOperation(#[error(not(source))] String),
    /// The cached file is dirty or mounted and can't be replaced right now.
    #[display("cache entry in use: {_0}")]
    InUse(#[error(not(source))] String),
    /// Eviction could not free enough space.
    #[display("not enough free space for {_0} bytes")]
    NoSpace(#[error(not(source))] u64),
    /// An underlying file-system operation failed.
    #[display("file operation failed: {}", _0.display())]
    Failed(#[error(not(source))] PathBuf),
    #[display("database error")]
    Database,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InUse(_) | Self::NoSpace(_) | Self::Failed(_) | Self::Database)
    }
}
