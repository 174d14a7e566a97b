//! Local mirror of a remote drive.
//!
//! [`Drive`] composes the pieces:
//! - a [`ResourceMetadata`] tree fed by a [`ChangeListProcessor`],
//! - a [`FileCache`] holding file bytes,
//! - metadata [`search`](drivefs_search::search) over both.
//!
//! The tree and the cache are each behind their own reader/writer lock: reads
//! run concurrently, writes are serialized, and neither structure waits on the
//! other's writers. They are correlated only through resource IDs and content
//! hashes, so either can be rebuilt without the other.

pub mod error;
pub mod feed;
mod sweep;

pub use crate::sweep::remove_stale_cache_files;

use crate::error::{ErrorKind, Result};
use drivefs_cache::{CacheEntry, FileCache, FileOperation, Partition};
use drivefs_config::Config;
use drivefs_metadata::{AboutResource, ChangeList, ChangeListProcessor, Entry, ResourceMetadata};
use drivefs_search::{SearchOptions, SearchResult};
use exn::ResultExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::instrument;

const METADATA_DB: &str = "resource_metadata.db";

pub struct Drive {
    tree: RwLock<ResourceMetadata>,
    cache: RwLock<FileCache>,
    search_max_results: usize,
}

impl Drive {
    /// Open the cache and the metadata tree below the configured cache root.
    #[instrument(skip(config), fields(root = %config.cache_root.display()))]
    pub async fn open(config: &Config) -> Result<Self> {
        let cache = FileCache::open(&config.cache_root, config.min_free_space)
            .await
            .or_raise(|| ErrorKind::Cache)?;
        let db_path = cache.paths().partition(Partition::Meta).join(METADATA_DB);
        let tree = ResourceMetadata::connect(&db_path).await.or_raise(|| ErrorKind::Metadata)?;
        Ok(Self::new(tree, cache, config.search_max_results))
    }

    pub fn new(tree: ResourceMetadata, cache: FileCache, search_max_results: usize) -> Self {
        Self { tree: RwLock::new(tree), cache: RwLock::new(cache), search_max_results }
    }

    pub fn tree(&self) -> &RwLock<ResourceMetadata> {
        &self.tree
    }

    pub fn cache(&self) -> &RwLock<FileCache> {
        &self.cache
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub async fn apply_full(&self, about: &AboutResource, change_lists: Vec<ChangeList>) -> Result<()> {
        let mut tree = self.tree.write().await;
        ChangeListProcessor::new(&mut tree)
            .apply_full(about, change_lists)
            .await
            .or_raise(|| ErrorKind::Metadata)
    }

    /// Apply a delta and return the directories whose listing changed.
    pub async fn apply_delta(&self, change_lists: Vec<ChangeList>) -> Result<BTreeSet<PathBuf>> {
        let mut tree = self.tree.write().await;
        ChangeListProcessor::new(&mut tree).apply_delta(change_lists).await.or_raise(|| ErrorKind::Metadata)
    }

    pub async fn refresh_directory(
        &self,
        directory_id: &str,
        changestamp: i64,
        change_lists: Vec<ChangeList>,
    ) -> Result<PathBuf> {
        let mut tree = self.tree.write().await;
        ChangeListProcessor::new(&mut tree)
            .refresh_directory(directory_id, changestamp, change_lists)
            .await
            .or_raise(|| ErrorKind::Metadata)
    }

    pub async fn largest_changestamp(&self) -> i64 {
        self.tree.read().await.largest_changestamp()
    }

    pub async fn get_by_path(&self, path: impl AsRef<Path>) -> Result<Entry> {
        let tree = self.tree.read().await;
        tree.get_by_path(path).cloned().or_raise(|| ErrorKind::Metadata)
    }

    pub async fn list_children(&self, path: impl AsRef<Path>) -> Result<Vec<Entry>> {
        let tree = self.tree.read().await;
        let children = tree.list_children(path).or_raise(|| ErrorKind::Metadata)?;
        Ok(children.into_iter().cloned().collect())
    }

    /// Search with the configured result limit unless one is given.
    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
        max_results: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        let tree = self.tree.read().await;
        let cache = self.cache.read().await;
        let max_results = max_results.unwrap_or(self.search_max_results);
        drivefs_search::search(&tree, &cache, query, options, max_results).await.or_raise(|| ErrorKind::Search)
    }

    // =========================================================================
    // Cache
    // =========================================================================

    pub async fn store(
        &self,
        resource_id: &str,
        content_hash: &str,
        source: impl AsRef<Path>,
        operation: FileOperation,
    ) -> Result<()> {
        let mut cache = self.cache.write().await;
        cache.store(resource_id, content_hash, source, operation).await.or_raise(|| ErrorKind::Cache)
    }

    pub async fn pin(&self, resource_id: &str, content_hash: &str) -> Result<()> {
        self.cache.write().await.pin(resource_id, content_hash).await.or_raise(|| ErrorKind::Cache)
    }

    pub async fn unpin(&self, resource_id: &str, content_hash: &str) -> Result<()> {
        self.cache.write().await.unpin(resource_id, content_hash).await.or_raise(|| ErrorKind::Cache)
    }

    pub async fn cache_entries(&self) -> Result<Vec<CacheEntry>> {
        self.cache.read().await.entries().await.or_raise(|| ErrorKind::Cache)
    }

    /// Evict if needed so that `bytes` fit. Returns whether they do.
    pub async fn free_disk_space_if_needed_for(&self, bytes: u64) -> Result<bool> {
        let mut cache = self.cache.write().await;
        cache.free_disk_space_if_needed_for(bytes).await.or_raise(|| ErrorKind::Cache)
    }

    /// Drop cached files the tree no longer vouches for. Returns how many
    /// entries were removed.
    pub async fn remove_stale_cache_files(&self) -> Result<usize> {
        let tree = self.tree.read().await;
        let mut cache = self.cache.write().await;
        remove_stale_cache_files(&mut cache, &tree).await
    }
}
