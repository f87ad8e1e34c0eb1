//! Database connection pool, migrations, and health check.
//!
//! SQLite is the single durable store: job rows, the event log and the
//! artifact registry. Reads go straight to the pool. Writes are serialized
//! through [`Db::begin_write`], which holds an in-process writer lock for the
//! lifetime of the transaction.

pub mod artifacts;
pub mod events;
pub mod jobs;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Database handle. Owns the connection pool shared across all components.
pub struct Db {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

/// The in-process writer lock, held past commit by [`WriteTx::commit_held`].
pub(crate) type WriteGuard<'a> = MutexGuard<'a, ()>;

/// An open write transaction. Commits on [`WriteTx::commit`], rolls back on drop.
pub(crate) struct WriteTx<'a> {
    // Dropped before the guard so a rollback is issued while still serialized.
    tx: Transaction<'static, Sqlite>,
    guard: WriteGuard<'a>,
}

impl<'a> WriteTx<'a> {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Commit and keep the writer lock until the returned guard is dropped.
    ///
    /// Events broadcast while the guard is alive reach subscribers in
    /// sequence order.
    pub async fn commit_held(self) -> Result<WriteGuard<'a>> {
        let (tx, guard) = self.into_parts();
        tx.commit().await?;
        Ok(guard)
    }

    /// The raw transaction and the lock, for callers that must stay
    /// serialized after a failed commit.
    pub fn into_parts(self) -> (Transaction<'static, Sqlite>, WriteGuard<'a>) {
        (self.tx, self.guard)
    }
}

impl Db {
    /// Connect to SQLite (creating the file if needed) and build a pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Open the database file at `path`.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Run SQLite's quick integrity check.
    pub async fn check_integrity(&self) -> Result<bool> {
        let (result,): (String,) = sqlx::query_as("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        Ok(result == "ok")
    }

    /// Close the pool, waiting for connections to be released.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Begin a serialized write transaction.
    ///
    /// Only one write transaction is open at a time in this process, which is
    /// what keeps sequence assignment and job-state guards free of races.
    pub(crate) async fn begin_write(&self) -> Result<WriteTx<'_>> {
        let guard = self.write_lock.lock().await;
        let tx = self.pool.begin().await.map_err(Error::from)?;
        Ok(WriteTx { tx, guard })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
