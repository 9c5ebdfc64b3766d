//! Database connection and pool management.

use exn::ResultExt;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Schema of a state snapshot, applied to every writable connection.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
/// Readers run concurrently; all writes go through one serialized path
/// in [`Repository`](crate::Repository) anyway.
const MAX_CONNECTIONS: u32 = 5;

/// Database connection pool for one state snapshot.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: Option<u32>, migrate: bool) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Connection-scoped settings; every pooled connection to the
            // snapshot needs them, not only the first one.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        if migrate {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// Open a writable state database at the given path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options, None, true).await
    }

    /// Open a downloaded snapshot for reading only.
    ///
    /// Snapshots never change after upload, so the file is opened immutable:
    /// SQLite skips locking and never creates journal files next to it.
    /// Migrations are not run.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .read_only(true)
            .immutable(true)
            .foreign_keys(true);
        Self::new(options, None, false).await
    }

    /// A migrated snapshot that only lives as long as its single connection.
    /// Not test-only: the engine's tests build repositories on it too.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // Each `:memory:` connection is its own database.
        Self::new(options, Some(1), true).await
    }

    /// Options for the working copy of a snapshot during an archive run.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // WAL while the run is in progress; switched back to a rollback
            // journal by `compact()` before the file is uploaded.
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            // Only the uploaded file has to survive a crash.
            .synchronous(SqliteSynchronous::Normal)
            // A busy database is retried for this long before the error
            // surfaces as fatal.
            .busy_timeout(Duration::from_millis(5000))
            // Each snapshot is written once and vacuumed whole by
            // `compact()`, never shrunk in place.
            .auto_vacuum(SqliteAutoVacuum::None)
    }

    /// Cache and scratch settings for querying one snapshot file.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
                PRAGMA mmap_size = 33554432;
                PRAGMA analysis_limit = 1000;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Bring the snapshot schema up to date.
    #[instrument("performing state database migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Pool over the snapshot file.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every connection to the snapshot, waiting for checked-out ones.
    /// Required before [`compact`](Self::compact) or deleting the file.
    pub async fn close(&self) {
        // Planner statistics end up in the uploaded file.
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }

    /// Turn a closed working database into a single self-contained file.
    ///
    /// Checkpoints and removes the write-ahead log, switches to a rollback
    /// journal, and vacuums. Must only be called once every pool on the file
    /// has been closed.
    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn compact(path: impl AsRef<Path>) -> Result<()> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_millis(5000));
        let mut conn = SqliteConnection::connect_with(&options).await.or_raise(|| ErrorKind::Database)?;
        sqlx::query("VACUUM").execute(&mut conn).await.or_raise(|| ErrorKind::Database)?;
        conn.close().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let db = Database::connect_in_memory().await.unwrap();
        assert!(!db.pool().is_closed());
        db.close().await;
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let db = Database::connect_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1, "foreign_keys should be ON");
        let row: (i64,) = sqlx::query_as("PRAGMA temp_store").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 2, "temp_store should be MEMORY");
        db.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_apply_to_every_pooled_connection() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path().join("state.db")).await.unwrap();
        let mut first = db.pool().acquire().await.unwrap();
        let mut second = db.pool().acquire().await.unwrap();
        for conn in [&mut first, &mut second] {
            let row: (i64,) = sqlx::query_as("PRAGMA temp_store").fetch_one(&mut **conn).await.unwrap();
            assert_eq!(row.0, 2);
            let row: (i64,) = sqlx::query_as("PRAGMA cache_size").fetch_one(&mut **conn).await.unwrap();
            assert_eq!(row.0, -8192);
        }
        drop((first, second));
        db.close().await;
    }

    #[tokio::test]
    async fn test_compact_leaves_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let db = Database::connect(&path).await.unwrap();
        sqlx::query("INSERT INTO chunks (hash, original_size, archived_size, storage_tier) VALUES ('a', 1, 2, 'hot')")
            .execute(db.pool())
            .await
            .unwrap();
        db.close().await;
        Database::compact(&path).await.unwrap();

        assert!(!dir.path().join("state.db-wal").exists());
        let db = Database::open_read_only(&path).await.unwrap();
        let row: (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, "delete");
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1);
        db.close().await;
    }
}
