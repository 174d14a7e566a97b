//! Metadata Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};

/// A metadata error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for metadata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No entry with that resource ID or path.
    #[display("entry not found: {_0}")]
    NotFound(#[error(not(source))] String),
    #[display("entry already exists: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    /// The operation conflicts with the entry's current state (reserved
    /// directories, type changes, cyclic parents).
    #[display("invalid operation: {_0}")]
    InvalidOperation(#[error(not(source))] String),
    #[display("not a directory: {_0}")]
    NotADirectory(#[error(not(source))] String),
    #[display("database error")]
    Database,
    /// Serialization/deserialization error.
    #[display("invalid metadata: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }

    /// Returns `true` if the error was caused by the entry being applied
    /// rather than by the store itself. Change list processing drops the
    /// offending entry and carries on for these.
    pub fn is_entry_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::AlreadyExists(_) | Self::InvalidOperation(_) | Self::NotADirectory(_)
        )
    }
}
