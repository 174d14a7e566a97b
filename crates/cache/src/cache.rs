//! The content cache.
//!
//! Every operation is one logical transaction: the file-system move, copy or
//! delete happens first, and the cache entry is only updated once it has
//! succeeded. If the file operation fails the entry is left untouched.
//!
//! Mutating operations take `&mut self`; the cache is a single-writer
//! structure and callers serialize writes.

use crate::error::{ErrorKind, Result};
use crate::models::CacheEntry;
use crate::observer::CacheObserver;
use crate::paths::{CacheOrigin, CachePaths, LOCALLY_MODIFIED, MOUNTED, Partition, parse_cache_file_name};
use crate::repo::Repository;
use crate::space::{FreeDiskSpace, StatvfsFreeDiskSpace};
use drivefs_db::Database;
use exn::{OptionExt, ResultExt};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::instrument;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
const METADATA_DB: &str = "cache_metadata.db";

/// Space kept free on the cache's file system at all times.
pub const DEFAULT_MIN_FREE_SPACE: u64 = 512 * 1024 * 1024;

/// How source bytes are brought into the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileOperation {
    /// Leave the source where it is.
    Copy,
    /// Take the source file. Assumed not to need extra space.
    Move,
}

pub struct FileCache {
    paths: CachePaths,
    repo: Repository,
    db: Database,
    free_space: Arc<dyn FreeDiskSpace>,
    min_free_space: u64,
    observers: Vec<Arc<dyn CacheObserver>>,
}

impl FileCache {
    /// Open (or create) the cache below `root`.
    ///
    /// If the cache metadata is missing or unreadable, it is rebuilt from the
    /// files found in the persistent and temporary partitions.
    #[instrument(skip(root), fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>, min_free_space: u64) -> Result<Self> {
        let paths = CachePaths::new(root.as_ref());
        create_partitions(&paths).await?;

        let db_path = paths.partition(Partition::Meta).join(METADATA_DB);
        let existed = fs::try_exists(&db_path).await.unwrap_or(false);
        let (db, fresh) = match Database::connect(&db_path, &MIGRATOR).await {
            Ok(db) => (db, !existed),
            Err(err) => {
                tracing::warn!(error = %*err, path = %db_path.display(), "Cache metadata is unreadable; rebuilding");
                for suffix in ["", "-wal", "-shm"] {
                    let mut path = db_path.clone().into_os_string();
                    path.push(suffix);
                    remove_file_if_exists(Path::new(&path)).await?;
                }
                let db = Database::connect(&db_path, &MIGRATOR).await.or_raise(|| ErrorKind::Database)?;
                (db, true)
            },
        };

        let mut cache = Self {
            paths,
            repo: Repository::from(&db),
            db,
            free_space: Arc::new(StatvfsFreeDiskSpace),
            min_free_space,
            observers: Vec::new(),
        };
        if fresh {
            cache.rebuild_from_disk().await?;
        }
        Ok(cache)
    }

    /// Replace the free disk space probe.
    pub fn with_free_disk_space(mut self, free_space: Arc<dyn FreeDiskSpace>) -> Self {
        self.free_space = free_space;
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn CacheObserver>) {
        self.observers.push(observer);
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub(crate) fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Close the metadata database.
    pub async fn close(&self) {
        self.db.close().await;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The entry for a resource, if it matches the given hash (see
    /// [`CacheEntry::matches_hash`]).
    pub async fn get_cache_entry(&self, resource_id: &str, content_hash: &str) -> Result<Option<CacheEntry>> {
        Ok(self.repo.get(resource_id).await?.filter(|e| e.matches_hash(content_hash)))
    }

    /// Every cache entry, ordered by resource ID.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.repo.list().await
    }

    /// Path of the cached file for a resource. The file must be present.
    pub async fn get_file(&self, resource_id: &str, content_hash: &str) -> Result<PathBuf> {
        match self.get_cache_entry(resource_id, content_hash).await? {
            Some(entry) if entry.is_present => Ok(self.paths.entry_path(&entry)),
            _ => exn::bail!(ErrorKind::NotFound(resource_id.to_string())),
        }
    }

    pub fn is_under_cache_dir(&self, path: impl AsRef<Path>) -> bool {
        self.paths.is_under_cache_dir(path)
    }

    pub fn cache_file_path(
        &self,
        resource_id: &str,
        content_hash: &str,
        partition: Partition,
        origin: CacheOrigin,
    ) -> PathBuf {
        self.paths.file_path(resource_id, content_hash, partition, origin)
    }

    /// Whether `bytes` fit while keeping the reserve free.
    pub fn has_enough_space_for(&self, bytes: u64) -> Result<bool> {
        let available = self.free_space.available(self.paths.root())?;
        // Already inside the reserve means nothing fits, not even zero bytes.
        Ok(available.checked_sub(self.min_free_space).is_some_and(|spare| spare >= bytes))
    }

    // =========================================================================
    // Storing
    // =========================================================================

    /// Store file bytes downloaded from the server.
    ///
    /// Fails with [`InUse`](ErrorKind::InUse) if the existing entry is dirty or
    /// mounted. Lands in the persistent partition if the entry was pinned.
    pub async fn store(
        &mut self,
        resource_id: &str,
        content_hash: &str,
        source: impl AsRef<Path>,
        operation: FileOperation,
    ) -> Result<()> {
        self.store_internal(resource_id, content_hash, source.as_ref(), operation, CacheOrigin::FromServer)
            .await
    }

    /// Store locally modified bytes. Always lands in the persistent partition
    /// and marks the entry dirty.
    pub async fn store_locally_modified(
        &mut self,
        resource_id: &str,
        content_hash: &str,
        source: impl AsRef<Path>,
        operation: FileOperation,
    ) -> Result<()> {
        self.store_internal(resource_id, content_hash, source.as_ref(), operation, CacheOrigin::LocallyModified)
            .await
    }

    #[instrument(skip(self, source), fields(source = %source.display()))]
    async fn store_internal(
        &mut self,
        resource_id: &str,
        content_hash: &str,
        source: &Path,
        operation: FileOperation,
        origin: CacheOrigin,
    ) -> Result<()> {
        let size = match operation {
            FileOperation::Copy => {
                fs::metadata(source).await.or_raise(|| ErrorKind::Failed(source.to_path_buf()))?.len()
            },
            FileOperation::Move => 0,
        };
        if !self.free_disk_space_if_needed_for(size).await? {
            exn::bail!(ErrorKind::NoSpace(size));
        }

        let existing = self.repo.get(resource_id).await?;
        if let Some(existing) = &existing {
            if existing.is_mounted || (existing.is_dirty && origin == CacheOrigin::FromServer) {
                exn::bail!(ErrorKind::InUse(resource_id.to_string()));
            }
        }
        let mut entry = existing.unwrap_or_else(|| CacheEntry::new(resource_id, ""));
        entry.content_hash = content_hash.to_string();
        entry.is_present = true;
        entry.is_dirty = origin == CacheOrigin::LocallyModified;

        let destination = self.paths.entry_path(&entry);
        match operation {
            FileOperation::Copy => copy_file(source, &destination).await?,
            FileOperation::Move => move_file(source, &destination).await?,
        }
        // Whatever was cached for this resource before is now stale.
        self.delete_files(resource_id, |path| path == destination).await?;
        self.repo.upsert(&entry).await?;
        tracing::debug!(resource_id, content_hash, dirty = entry.is_dirty, "Stored file");
        Ok(())
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Keep a resource available offline. Pinning something that isn't cached
    /// yet records the pin so the download lands in the persistent partition.
    #[instrument(skip(self))]
    pub async fn pin(&mut self, resource_id: &str, content_hash: &str) -> Result<()> {
        let entry = match self.get_cache_entry(resource_id, content_hash).await? {
            Some(mut entry) => {
                let from = self.paths.entry_path(&entry);
                entry.is_pinned = true;
                if !entry.is_dirty && !content_hash.is_empty() {
                    entry.content_hash = content_hash.to_string();
                }
                if entry.is_present {
                    move_file(&from, &self.paths.entry_path(&entry)).await?;
                }
                entry
            },
            None => {
                // A cached copy of some other version is of no use any more.
                match self.repo.get(resource_id).await? {
                    Some(stale) if stale.is_mounted => exn::bail!(ErrorKind::InUse(resource_id.to_string())),
                    Some(_) => self.delete_files(resource_id, |_| false).await?,
                    None => {},
                }
                CacheEntry { is_pinned: true, ..CacheEntry::new(resource_id, content_hash) }
            },
        };
        self.repo.upsert(&entry).await?;
        for observer in &self.observers {
            observer.on_cache_pinned(resource_id, content_hash);
        }
        Ok(())
    }

    /// Undo [`pin`](Self::pin). The file moves back to the temporary
    /// partition unless it is dirty or mounted; a pin-only entry is dropped.
    /// Afterwards, space is reclaimed if the cache is over budget.
    #[instrument(skip(self))]
    pub async fn unpin(&mut self, resource_id: &str, content_hash: &str) -> Result<()> {
        let mut entry = self
            .get_cache_entry(resource_id, content_hash)
            .await?
            .ok_or_raise(|| ErrorKind::NotFound(resource_id.to_string()))?;
        let from = self.paths.entry_path(&entry);
        entry.is_pinned = false;
        if entry.is_present {
            move_file(&from, &self.paths.entry_path(&entry)).await?;
        }
        match entry.is_present || entry.is_dirty || entry.is_mounted {
            true => self.repo.upsert(&entry).await?,
            false => self.repo.delete(resource_id).await?,
        }
        for observer in &self.observers {
            observer.on_cache_unpinned(resource_id, content_hash);
        }
        if let Err(err) = self.free_disk_space_if_needed_for(0).await {
            tracing::warn!(error = %*err, "Could not reclaim space after unpinning");
        }
        Ok(())
    }

    /// Expose a cached file to an external consumer. Returns the new path.
    #[instrument(skip(self))]
    pub async fn mark_as_mounted(&mut self, resource_id: &str, content_hash: &str) -> Result<PathBuf> {
        let mut entry = match self.get_cache_entry(resource_id, content_hash).await? {
            Some(entry) if entry.is_present => entry,
            _ => exn::bail!(ErrorKind::NotFound(resource_id.to_string())),
        };
        if entry.is_mounted {
            exn::bail!(ErrorKind::InvalidOperation(format!("{resource_id} is already mounted")));
        }
        let from = self.paths.entry_path(&entry);
        entry.is_mounted = true;
        let to = self.paths.entry_path(&entry);
        move_file(&from, &to).await?;
        relax_permissions(&to).await?;
        self.repo.upsert(&entry).await?;
        Ok(to)
    }

    /// Inverse of [`mark_as_mounted`](Self::mark_as_mounted), given the path
    /// it returned. Returns the file's new path.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn mark_as_unmounted(&mut self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let invalid = || ErrorKind::InvalidOperation(format!("{} is not a mounted cache file", path.display()));
        if !self.paths.is_under_cache_dir(path) {
            exn::bail!(invalid());
        }
        let parsed = parse_cache_file_name(path).ok_or_raise(invalid)?;
        if parsed.extra != MOUNTED {
            exn::bail!(invalid());
        }
        let hash = match parsed.content_hash.as_str() {
            LOCALLY_MODIFIED => "",
            hash => hash,
        };
        let mut entry = self
            .get_cache_entry(&parsed.resource_id, hash)
            .await?
            .ok_or_raise(|| ErrorKind::NotFound(parsed.resource_id.clone()))?;
        if !entry.is_mounted {
            exn::bail!(invalid());
        }
        let from = self.paths.entry_path(&entry);
        entry.is_mounted = false;
        let to = self.paths.entry_path(&entry);
        move_file(&from, &to).await?;
        self.repo.upsert(&entry).await?;
        Ok(to)
    }

    /// Mark a cached file as locally modified. It moves to the persistent
    /// partition under the locally-modified name.
    #[instrument(skip(self))]
    pub async fn mark_dirty(&mut self, resource_id: &str, content_hash: &str) -> Result<()> {
        // The hash is deliberately not checked: the local copy is what matters.
        let mut entry = match self.repo.get(resource_id).await? {
            Some(entry) if entry.is_present => entry,
            _ => exn::bail!(ErrorKind::NotFound(resource_id.to_string())),
        };
        if entry.is_dirty {
            return Ok(());
        }
        if entry.is_mounted {
            exn::bail!(ErrorKind::InUse(resource_id.to_string()));
        }
        let from = self.paths.entry_path(&entry);
        entry.is_dirty = true;
        move_file(&from, &self.paths.entry_path(&entry)).await?;
        self.repo.upsert(&entry).await?;
        tracing::debug!(resource_id, content_hash, "Marked dirty");
        Ok(())
    }

    /// Announce that a dirty file is ready to be uploaded.
    pub async fn commit_dirty(&mut self, resource_id: &str, content_hash: &str) -> Result<()> {
        let entry = match self.repo.get(resource_id).await? {
            Some(entry) if entry.is_present => entry,
            _ => exn::bail!(ErrorKind::NotFound(resource_id.to_string())),
        };
        if !entry.is_dirty {
            exn::bail!(ErrorKind::InvalidOperation(format!("{resource_id} is not dirty")));
        }
        tracing::debug!(resource_id, content_hash, "Committed dirty file");
        for observer in &self.observers {
            observer.on_cache_committed(resource_id);
        }
        Ok(())
    }

    /// The local edits have been uploaded and the server now knows the file
    /// as `content_hash`.
    #[instrument(skip(self))]
    pub async fn clear_dirty(&mut self, resource_id: &str, content_hash: &str) -> Result<()> {
        let mut entry = match self.repo.get(resource_id).await? {
            Some(entry) if entry.is_present => entry,
            _ => exn::bail!(ErrorKind::NotFound(resource_id.to_string())),
        };
        if !entry.is_dirty {
            exn::bail!(ErrorKind::InvalidOperation(format!("{resource_id} is not dirty")));
        }
        if entry.is_mounted {
            exn::bail!(ErrorKind::InUse(resource_id.to_string()));
        }
        let from = self.paths.entry_path(&entry);
        entry.is_dirty = false;
        entry.content_hash = content_hash.to_string();
        move_file(&from, &self.paths.entry_path(&entry)).await?;
        self.repo.upsert(&entry).await?;
        Ok(())
    }

    /// Forget a resource and delete its files. Dirty or mounted entries are
    /// left alone (and this still succeeds): their content is either unsynced
    /// or in use.
    #[instrument(skip(self))]
    pub async fn remove(&mut self, resource_id: &str) -> Result<()> {
        let Some(entry) = self.repo.get(resource_id).await? else {
            return Ok(());
        };
        if entry.is_dirty || entry.is_mounted {
            tracing::debug!(resource_id, "Not removing dirty or mounted cache entry");
            return Ok(());
        }
        self.delete_files(resource_id, is_locally_modified).await?;
        self.repo.delete(resource_id).await?;
        Ok(())
    }

    // =========================================================================
    // Space management
    // =========================================================================

    /// Make sure `bytes` fit while keeping the reserve free, evicting every
    /// non-persistent entry if they don't. Returns whether they fit now.
    #[instrument(skip(self))]
    pub async fn free_disk_space_if_needed_for(&mut self, bytes: u64) -> Result<bool> {
        if self.has_enough_space_for(bytes)? {
            return Ok(true);
        }
        self.remove_temporary_files().await?;
        self.has_enough_space_for(bytes)
    }

    /// Drop every non-persistent entry along with the files in the temporary
    /// partition. Its `downloads` and `documents` subdirectories are left
    /// alone.
    #[instrument(skip(self))]
    pub async fn remove_temporary_files(&mut self) -> Result<()> {
        let mut deleted = 0usize;
        for path in list_files(&self.paths.partition(Partition::Tmp)).await? {
            remove_file_if_exists(&path).await?;
            deleted += 1;
        }
        let evicted = self.repo.delete_temporary().await?;
        tracing::info!(evicted, deleted, "Evicted temporary cache files");
        Ok(())
    }

    /// Delete every entry and cached file, keeping the metadata partition.
    #[instrument(skip(self))]
    pub async fn clear_all(&mut self) -> Result<()> {
        for partition in [Partition::Persistent, Partition::Tmp] {
            let path = self.paths.partition(partition);
            match fs::remove_dir_all(&path).await {
                Ok(()) => {},
                Err(e) if e.kind() == IoErrorKind::NotFound => {},
                Err(e) => return Err(e).or_raise(|| ErrorKind::Failed(path)),
            }
        }
        create_partitions(&self.paths).await?;
        self.repo.delete_all().await?;
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Delete the files of a resource in the persistent and temporary
    /// partitions, except those `keep` says to leave.
    pub(crate) async fn delete_files(&self, resource_id: &str, keep: impl Fn(&Path) -> bool) -> Result<()> {
        for partition in [Partition::Persistent, Partition::Tmp] {
            for path in list_files(&self.paths.partition(partition)).await? {
                let matches = parse_cache_file_name(&path).is_some_and(|parsed| parsed.resource_id == resource_id);
                if matches && !keep(&path) {
                    tracing::trace!(path = %path.display(), "Deleting cache file");
                    remove_file_if_exists(&path).await?;
                }
            }
        }
        Ok(())
    }
}

fn is_locally_modified(path: &Path) -> bool {
    parse_cache_file_name(path).is_some_and(|parsed| parsed.content_hash == LOCALLY_MODIFIED)
}

pub(crate) async fn create_partitions(paths: &CachePaths) -> Result<()> {
    for partition in Partition::ALL {
        let path = paths.partition(partition);
        fs::create_dir_all(&path).await.or_raise(|| ErrorKind::Failed(path.clone()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Others may traverse into (mounted files) but not list the directory.
        let path = paths.partition(Partition::Persistent);
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o711))
            .await
            .or_raise(|| ErrorKind::Failed(path.clone()))?;
    }
    Ok(())
}

/// Regular files directly inside `dir`. A missing directory has none.
pub(crate) async fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).or_raise(|| ErrorKind::Failed(dir.to_path_buf())),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Failed(dir.to_path_buf()))? {
        let file_type = entry.file_type().await.or_raise(|| ErrorKind::Failed(entry.path()))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if from == to {
        return Ok(());
    }
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::CrossesDevices => {
            copy_file(from, to).await?;
            fs::remove_file(from).await.or_raise(|| ErrorKind::Failed(from.to_path_buf()))
        },
        Err(e) => Err(e).or_raise(|| ErrorKind::Failed(from.to_path_buf())),
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to).await.or_raise(|| ErrorKind::Failed(to.to_path_buf()))?;
    Ok(())
}

pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).or_raise(|| ErrorKind::Failed(path.to_path_buf())),
    }
}

async fn relax_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
            .await
            .or_raise(|| ErrorKind::Failed(path.to_path_buf()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
