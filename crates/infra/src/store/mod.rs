//! SQLite-backed persistent job store.
//!
//! Durable, crash-safe storage usable by several processes on one machine:
//!
//! - write-ahead journaling (`journal_mode=WAL`, `synchronous=NORMAL`)
//! - bounded lock wait (`busy_timeout`) so writers contend instead of deadlocking
//! - idempotent schema creation with additive column migration
//! - one database file per bound port for physical instance isolation
//!
//! `JobStore` is cheap to clone; clones share the connection pool.

pub mod error;
pub(crate) mod row;
pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

use crate::config::QueueConfig;

pub use error::StoreError;
pub use schema::MigrationReport;

/// Handle to the `jobs` database.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl JobStore {
    /// Open (creating if needed) the database for `config`'s port.
    pub async fn open(config: &QueueConfig) -> Result<Self, StoreError> {
        Self::open_path(
            &config.database_path(),
            config.busy_timeout,
            config.max_connections,
        )
        .await
    }

    /// Open a database file at an explicit path.
    pub async fn open_path(
        path: &Path,
        busy_timeout: Duration,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        // The path is handed over verbatim; a `sqlite://` URL would
        // percent-decode directory names.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(busy_timeout.max(Duration::from_secs(1)) * 2)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::sqlx("connect", e))?;

        let report = schema::migrate(&pool).await?;

        info!(
            path = %path.display(),
            added_columns = report.added_columns.len(),
            "job store opened"
        );

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Re-run schema creation/migration (no-op on an up-to-date database).
    pub async fn migrate(&self) -> Result<MigrationReport, StoreError> {
        schema::migrate(&self.pool).await
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
