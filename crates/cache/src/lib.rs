//! On-disk content cache for drivefs.
//!
//! Holds the bytes of remote files below a cache root, split into partitions
//! by retention class. Each cached resource has one [`CacheEntry`] whose flags
//! (present, pinned, dirty, mounted) decide where its file lives and whether it
//! may be evicted.
//!
//! # Architecture
//! - **Files** are the source of truth for content. Their names encode the
//!   resource ID, the content hash and the origin (see [`paths`]).
//! - **Entries** live in a SQLite database in the `meta` partition. If it is
//!   deleted, it is rebuilt by scanning the partitions; only pin state is lost.
//!
//! Persistent entries (pinned, dirty or mounted) are never evicted. Everything
//! else is dropped as soon as free space falls below the configured reserve.

mod cache;
pub mod error;
mod models;
mod observer;
pub mod paths;
mod repo;
mod scan;
mod space;

pub use crate::cache::{DEFAULT_MIN_FREE_SPACE, FileCache, FileOperation};
pub use crate::models::CacheEntry;
pub use crate::observer::CacheObserver;
pub use crate::paths::{CacheOrigin, CachePaths, Partition};
pub use crate::space::{FixedFreeDiskSpace, FreeDiskSpace, StatvfsFreeDiskSpace};
