use crate::error::{ErrorKind, Result};
use drivefs_cache::FileCache;
use drivefs_metadata::ResourceMetadata;
use exn::ResultExt;
use tracing::instrument;

/// Remove cache entries the tree no longer vouches for: resources that are
/// gone from the tree, and present files whose content hash differs from the
/// tree's. Dirty and mounted entries are left alone by
/// [`FileCache::remove`]. Returns how many entries were removed.
#[instrument(skip_all)]
pub async fn remove_stale_cache_files(cache: &mut FileCache, tree: &ResourceMetadata) -> Result<usize> {
    let entries = cache.entries().await.or_raise(|| ErrorKind::Cache)?;
    let mut removed = 0usize;
    for entry in entries {
        if entry.is_dirty || entry.is_mounted {
            continue;
        }
        let stale = match tree.get_by_id(&entry.resource_id) {
            Ok(known) => entry.is_present && known.content_hash != entry.content_hash,
            Err(_) => true,
        };
        if stale {
            tracing::debug!(resource_id = %entry.resource_id, "Removing stale cache entry");
            cache.remove(&entry.resource_id).await.or_raise(|| ErrorKind::Cache)?;
            removed += 1;
        }
    }
    tracing::info!(removed, "Swept stale cache entries");
    Ok(removed)
}
