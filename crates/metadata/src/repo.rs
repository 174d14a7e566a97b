//! Persistence for the resource metadata tree.
//!
//! The tree keeps everything in memory and writes through to this repository
//! on every mutation, so the database only ever has to be read once on
//! startup.

use crate::error::{ErrorKind, Result};
use crate::models::{Entry, EntryRow};
use drivefs_db::Database;
use exn::ResultExt;
use sqlx::SqlitePool;

const LARGEST_CHANGESTAMP: &str = "largest_changestamp";

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
    pub(crate) async fn load_all(&self) -> Result<Vec<Entry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(include_str!("../queries/select_entries.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Entry::try_from).collect()
    }

    pub(crate) async fn upsert(&self, entry: &Entry) -> Result<()> {
        let row = EntryRow::try_from(entry)?;
        sqlx::query(include_str!("../queries/upsert_entry.sql"))
            .bind(row.resource_id)
            .bind(row.parent_resource_id)
            .bind(row.title)
            .bind(row.base_name)
            .bind(row.is_directory)
            .bind(row.content_hash)
            .bind(row.size)
            .bind(row.last_accessed)
            .bind(row.last_modified)
            .bind(row.directory_changestamp)
            .bind(row.shared_with_me)
            .bind(row.is_hosted_document)
            .bind(row.document_extension)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Delete all of the given entries in one transaction.
    pub(crate) async fn delete_many(&self, resource_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for id in resource_ids {
            sqlx::query("DELETE FROM entries WHERE resource_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    /// Delete every entry except the given ones, and forget the changestamp.
    pub(crate) async fn reset(&self, keep: &[&str]) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let placeholders = vec!["?"; keep.len()].join(", ");
        let sql = format!("DELETE FROM entries WHERE resource_id NOT IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in keep {
            query = query.bind(*id);
        }
        query.execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        sqlx::query("DELETE FROM properties WHERE key = ?")
            .bind(LARGEST_CHANGESTAMP)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn largest_changestamp(&self) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM properties WHERE key = ?")
            .bind(LARGEST_CHANGESTAMP)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(|(value,)| value).unwrap_or_default())
    }

    pub(crate) async fn set_largest_changestamp(&self, value: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO properties (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(LARGEST_CHANGESTAMP)
        .bind(value)
        .execute(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}
