//! SQLite connection pool shared by the metadata stores.
//!
//! Each store (the resource metadata tree and the cache metadata) owns its own
//! database file under the cache's `meta` partition and brings its own
//! embedded migrations. This crate only knows how to open a pool with the
//! right PRAGMAs and run whatever migrator it is handed.

pub mod error;

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::error::{ErrorKind, Result};

// Writes are serialized by the owning structure, so this only needs to cover
// concurrent readers.
const MAX_CONNECTIONS: u32 = 4;

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(
        options: SqliteConnectOptions,
        max: Option<u32>,
        migrator: &'static Migrator,
        label: PathBuf,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // This is IMPORTANT to apply the query-based PRAGMAs to EVERY
            // connection (set by max connections) instead of only the
            // first connection returned by the pool.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Open(label))?;
        let db = Self { pool };
        db.migrate(migrator).await?;
        Ok(db)
    }

    /// Connect to the database at the given path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn connect(path: impl AsRef<Path>, migrator: &'static Migrator) -> Result<Self> {
        let path = path.as_ref();
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options, None, migrator, path.to_path_buf()).await
    }

    /// Connect to an in-memory database (useful for testing).
    ///
    /// Note:
    /// - In-memory databases are destroyed when the connection closes.
    /// - Do NOT apply `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn connect_in_memory(migrator: &'static Migrator) -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // In-memory database must either use the same cache `.shared_cache(true)`,
        // or be limited to one connection. Otherwise parallel connections will
        // see different databases that contain different data.
        Self::new(options, Some(1), migrator, PathBuf::from(":memory:")).await
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // Applying a large full listing holds the write lock for a while.
            .busy_timeout(std::time::Duration::from_millis(1500))
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA locking_mode = NORMAL;
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("performing database migrations", skip(migrator))]
    async fn migrate(&self, migrator: &'static Migrator) -> Result<()> {
        migrator.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    ///
    /// This waits for all connections to be returned to the pool and then
    /// closes them. After calling this, the Database instance should not
    /// be used.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_MIGRATOR: Migrator = sqlx::migrate!("./tests/fixtures/migrations");

    #[tokio::test]
    async fn test_connect_in_memory() {
        let db = Database::connect_in_memory(&TEST_MIGRATOR).await.unwrap();
        assert!(!db.pool().is_closed());
        db.close().await;
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::connect_in_memory(&TEST_MIGRATOR).await.unwrap();
        db.migrate(&TEST_MIGRATOR).await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let db = Database::connect_in_memory(&TEST_MIGRATOR).await.unwrap();
        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1, "foreign_keys should be ON");
        let row: (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 800, "WAL checkpoint should be 800");
        db.close().await;
    }

    #[tokio::test]
    async fn test_connect_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::connect(&path, &TEST_MIGRATOR).await.unwrap();
        sqlx::query("INSERT INTO properties (key, value) VALUES ('a', 'b')")
            .execute(db.pool())
            .await
            .unwrap();
        db.close().await;
        assert!(path.exists());
        // Reopening keeps the data and doesn't re-run the migration.
        let db = Database::connect(&path, &TEST_MIGRATOR).await.unwrap();
        let row: (String,) = sqlx::query_as("SELECT value FROM properties WHERE key = 'a'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.0, "b");
        db.close().await;
    }

    #[tokio::test]
    async fn test_connect_rejects_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();
        let err = Database::connect(&path, &TEST_MIGRATOR).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Open(_) | ErrorKind::Migration));
    }
}
