//! SQLite-backed persistent store.
//!
//! Single source of truth for work item state. WAL journal with
//! `synchronous=FULL`, so a write that returned has been committed to disk.

pub mod work;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::debug;

use crate::error::Result;

pub use work::{RecoveryReport, StateCounts};

/// Store handle. Owns the connection pool shared by every pipeline role.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open or create a database file and run pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        debug!(path = %path.display(), "store opened");
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// Each SQLite memory connection is its own database, so the pool is pinned
    /// to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Run `SELECT 1` against the pool.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close every connection. Pending writes have already been committed.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
