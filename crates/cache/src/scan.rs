//! Rebuilding cache metadata from the files on disk.
//!
//! Runs when the metadata database is new or had to be recreated. Pin state
//! lives only in the database, so every surviving clean file ends up in the
//! temporary partition.

use crate::cache::{FileCache, list_files, move_file, remove_file_if_exists};
use crate::error::Result;
use crate::models::CacheEntry;
use crate::paths::{LOCALLY_MODIFIED, MOUNTED, Partition, parse_cache_file_name};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::instrument;

impl FileCache {
    #[instrument(skip(self))]
    pub(crate) async fn rebuild_from_disk(&mut self) -> Result<()> {
        let mut found: BTreeMap<String, (CacheEntry, Option<PathBuf>)> = BTreeMap::new();

        for partition in [Partition::Persistent, Partition::Tmp] {
            for path in list_files(&self.paths().partition(partition)).await? {
                let Some(parsed) = parse_cache_file_name(&path) else {
                    tracing::warn!(path = %path.display(), "Deleting unrecognised cache file");
                    remove_file_if_exists(&path).await?;
                    continue;
                };
                let mut entry = CacheEntry::new(&parsed.resource_id, "");

                if parsed.extra == MOUNTED {
                    // Whoever had it mounted is gone. Keep the resource known
                    // but not present so it gets downloaded again.
                    tracing::warn!(path = %path.display(), "Deleting stale mounted file");
                    remove_file_if_exists(&path).await?;
                    found.entry(parsed.resource_id).or_insert((entry, None));
                    continue;
                }
                if parsed.content_hash == LOCALLY_MODIFIED {
                    if partition != Partition::Persistent {
                        tracing::warn!(path = %path.display(), "Deleting locally modified file outside persistent");
                        remove_file_if_exists(&path).await?;
                        continue;
                    }
                    entry.is_dirty = true;
                } else {
                    entry.content_hash = parsed.content_hash;
                }
                entry.is_present = true;

                match found.get(&parsed.resource_id) {
                    // A dirty copy beats anything else.
                    Some((existing, Some(existing_path))) if existing.is_present && !entry.is_dirty => {
                        tracing::warn!(
                            path = %path.display(),
                            kept = %existing_path.display(),
                            "Deleting duplicate cache file"
                        );
                        remove_file_if_exists(&path).await?;
                    },
                    Some((existing, Some(existing_path))) if existing.is_present => {
                        tracing::warn!(
                            path = %existing_path.display(),
                            kept = %path.display(),
                            "Deleting duplicate cache file"
                        );
                        remove_file_if_exists(existing_path).await?;
                        found.insert(parsed.resource_id, (entry, Some(path)));
                    },
                    _ => {
                        found.insert(parsed.resource_id, (entry, Some(path)));
                    },
                }
            }
        }

        let mut restored = 0usize;
        for (entry, path) in found.into_values() {
            if let Some(path) = path {
                move_file(&path, &self.paths().entry_path(&entry)).await?;
            }
            self.repo().upsert(&entry).await?;
            restored += 1;
        }
        tracing::info!(restored, "Rebuilt cache metadata from disk");
        Ok(())
    }
}
