//! JSON change feeds.
//!
//! A change feed is what the remote client hands over after fetching a full
//! listing or a delta:
//!
//! ```json
//! {
//!   "largest_changestamp": 124,
//!   "entries": [
//!     { "resource_id": "f1", "parent_resource_id": "root", "title": "B.txt", "content_hash": "h1" }
//!   ]
//! }
//! ```
//!
//! Timestamps are unix seconds. Everything but `resource_id` is optional. A
//! full listing also needs an about document naming the "My Drive" root and
//! the watermark: `{ "root_resource_id": "root", "largest_changestamp": 124 }`.

use crate::error::{ErrorKind, Result};
use drivefs_metadata::{AboutResource, ChangeList, DEFAULT_DOCUMENT_EXTENSION, Entry};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use time::UtcDateTime;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedEntry {
    pub resource_id: String,
    pub parent_resource_id: String,
    pub title: String,
    pub is_directory: bool,
    pub deleted: bool,
    pub content_hash: String,
    pub size: u64,
    pub last_accessed: i64,
    pub last_modified: i64,
    pub shared_with_me: bool,
    pub is_hosted_document: bool,
    /// Defaults to `.gdoc` for hosted documents.
    pub document_extension: Option<String>,
}

impl TryFrom<FeedEntry> for Entry {
    type Error = crate::error::Error;

    fn try_from(feed: FeedEntry) -> Result<Self> {
        if feed.resource_id.is_empty() {
            exn::bail!(ErrorKind::FeedEntry("without resource_id".to_string()));
        }
        let timestamp = |seconds: i64| {
            UtcDateTime::from_unix_timestamp(seconds).or_raise(|| ErrorKind::FeedEntry(feed.resource_id.clone()))
        };
        let last_accessed = timestamp(feed.last_accessed)?;
        let last_modified = timestamp(feed.last_modified)?;

        let mut entry = match feed.is_directory {
            true => Entry::directory(feed.resource_id, feed.parent_resource_id, feed.title),
            false => Entry::file(feed.resource_id, feed.parent_resource_id, feed.title),
        }
        .with_content_hash(feed.content_hash)
        .with_size(feed.size)
        .with_last_accessed(last_accessed)
        .with_last_modified(last_modified)
        .with_deleted(feed.deleted)
        .with_shared_with_me(feed.shared_with_me);
        if feed.is_hosted_document {
            let extension = feed.document_extension.unwrap_or_else(|| DEFAULT_DOCUMENT_EXTENSION.to_string());
            entry = entry.with_hosted_document(extension);
        }
        Ok(entry)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Feed {
    #[serde(default)]
    pub largest_changestamp: i64,
    #[serde(default)]
    pub entries: Vec<FeedEntry>,
}

impl TryFrom<Feed> for ChangeList {
    type Error = crate::error::Error;

    fn try_from(feed: Feed) -> Result<Self> {
        let entries = feed.entries.into_iter().map(Entry::try_from).collect::<Result<Vec<_>>>()?;
        Ok(ChangeList { entries, largest_changestamp: feed.largest_changestamp })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct About {
    pub root_resource_id: String,
    pub largest_changestamp: i64,
}

impl From<About> for AboutResource {
    fn from(about: About) -> Self {
        AboutResource { root_resource_id: about.root_resource_id, largest_changestamp: about.largest_changestamp }
    }
}

pub fn parse_change_list(json: &[u8]) -> Result<ChangeList> {
    let feed: Feed = serde_json::from_slice(json).or_raise(|| ErrorKind::Feed(Default::default()))?;
    ChangeList::try_from(feed)
}

pub async fn read_change_list(path: impl AsRef<Path>) -> Result<ChangeList> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.or_raise(|| ErrorKind::Feed(path.to_path_buf()))?;
    let feed: Feed = serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Feed(path.to_path_buf()))?;
    ChangeList::try_from(feed).or_raise(|| ErrorKind::Feed(path.to_path_buf()))
}

pub async fn read_about(path: impl AsRef<Path>) -> Result<AboutResource> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.or_raise(|| ErrorKind::Feed(path.to_path_buf()))?;
    let about: About = serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Feed(path.to_path_buf()))?;
    Ok(about.into())
}
