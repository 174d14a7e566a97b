//! Cache metadata persistence.
//!
//! The database is not the source of truth for file bytes, the partitions on
//! disk are. If the database is lost it is rebuilt by scanning them (see
//! `scan.rs`), losing only pin state.

use crate::error::{ErrorKind, Result};
use crate::models::{CacheEntry, CacheEntryRow};
use drivefs_db::Database;
use exn::ResultExt;
use sqlx::SqlitePool;

const SELECT: &str =
    "SELECT resource_id, content_hash, is_present, is_pinned, is_dirty, is_mounted, is_persistent FROM cache_entries";

#[derive(Debug, Clone)]
pub(crate) struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub(crate) async fn get(&self, resource_id: &str) -> Result<Option<CacheEntry>> {
        let row: Option<CacheEntryRow> = sqlx::query_as(&format!("{SELECT} WHERE resource_id = ?"))
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(CacheEntry::from))
    }

    pub(crate) async fn list(&self) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!("{SELECT} ORDER BY resource_id"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(CacheEntry::from).collect())
    }

    pub(crate) async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let row = CacheEntryRow::from(entry);
        sqlx::query(
            r#"
                INSERT INTO cache_entries
                    (resource_id, content_hash, is_present, is_pinned, is_dirty, is_mounted, is_persistent)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (resource_id) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    is_present = excluded.is_present,
                    is_pinned = excluded.is_pinned,
                    is_dirty = excluded.is_dirty,
                    is_mounted = excluded.is_mounted,
                    is_persistent = excluded.is_persistent
            "#,
        )
        .bind(row.resource_id)
        .bind(row.content_hash)
        .bind(row.is_present)
        .bind(row.is_pinned)
        .bind(row.is_dirty)
        .bind(row.is_mounted)
        .bind(row.is_persistent)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub(crate) async fn delete(&self, resource_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Drop every entry that isn't persistent. Returns how many went.
    pub(crate) async fn delete_temporary(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE is_persistent = 0")
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    pub(crate) async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}
