//! Drive Error Types
//!
//! Each component keeps its own error tree; these kinds say which component
//! (or input) an operation failed in.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A drive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for drive operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("metadata tree operation failed")]
    Metadata,
    #[display("content cache operation failed")]
    Cache,
    #[display("search failed")]
    Search,
    /// A change feed or about document could not be read or understood.
    #[display("invalid feed: {}", _0.display())]
    Feed(#[error(not(source))] PathBuf),
    /// A feed entry carried a value that can't be represented.
    #[display("invalid feed entry {_0}")]
    FeedEntry(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Metadata | Self::Cache | Self::Search)
    }
}
