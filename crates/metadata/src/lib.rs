//! Resource metadata for the local drive mirror.
//!
//! This crate owns the mapping from remote resource IDs to [`Entry`] records
//! and the hierarchical paths they resolve to. The tree is the single source
//! of truth for what the mirror currently looks like; it is kept in step with
//! the remote store by feeding full listings and deltas through the
//! [`ChangeListProcessor`].
//!
//! # Architecture
//! - [`ResourceMetadata`]: in-memory index written through to SQLite. It is a
//!   single-writer structure; callers serialize mutations.
//! - [`ChangeListProcessor`]: stateless, borrows the tree for the duration of
//!   one batch and reports which directory listings changed.

mod change_list;
pub mod error;
mod models;
mod repo;
mod tree;

pub use crate::change_list::{AboutResource, ChangeList, ChangeListProcessor, EntryMap, MY_DRIVE_NAME, convert_to_map};
pub use crate::models::Entry;
pub use crate::models::entry::DEFAULT_DOCUMENT_EXTENSION;
pub use crate::tree::{
    GRAND_ROOT_ID, GRAND_ROOT_NAME, ORPHAN_BUCKET_ID, ORPHAN_BUCKET_NAME, ResourceMetadata, is_reserved,
};
