//! Schema creation and additive migration.
//!
//! The base table matches what the earliest deployments created. Columns
//! added since then are listed in [`ADDITIVE_COLUMNS`] and appended with
//! `ALTER TABLE ADD COLUMN` when missing, so fresh and upgraded databases
//! converge through the same path without touching existing rows.

use sqlx::pool::PoolConnection;
use sqlx::{Connection, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{info, instrument, warn};

use super::error::StoreError;

const BASE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id           TEXT PRIMARY KEY,
    method           TEXT NOT NULL,
    params_json      TEXT NOT NULL,
    idempotency_key  TEXT NULL,
    priority         INTEGER NOT NULL DEFAULT 100,
    state            TEXT NOT NULL DEFAULT 'ENQUEUED',
    enqueue_ts       TEXT NOT NULL DEFAULT (CURRENT_TIMESTAMP),
    start_ts         TEXT NULL,
    heartbeat_ts     TEXT NULL,
    finish_ts        TEXT NULL,
    timeout_sec      INTEGER NOT NULL DEFAULT 15,
    attempts         INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL DEFAULT 3,
    result_json      TEXT NULL,
    error_code       TEXT NULL,
    error_msg        TEXT NULL
);
"#;

/// Columns added after the base schema, in the order they were introduced.
pub const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("rpc_id", "TEXT NULL"),
    ("target_port", "INTEGER NULL"),
    ("claim_ts", "TEXT NULL"),
];

const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_state_priority ON jobs(state, priority, enqueue_ts);
CREATE INDEX IF NOT EXISTS idx_jobs_port_state ON jobs(target_port, state, priority, enqueue_ts);
CREATE INDEX IF NOT EXISTS idx_jobs_rpc_id ON jobs(rpc_id);
"#;

/// Uniqueness is what makes idempotent enqueue race-free across processes.
const IDEMPOTENCY_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_jobs_idempotency_key ON jobs(idempotency_key)";

/// What a migration run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub added_columns: Vec<&'static str>,
}

/// Create the schema if missing and add any missing columns.
///
/// Runs under `BEGIN IMMEDIATE` so processes opening the same database at
/// the same time apply the migration one after another.
#[instrument(skip(pool), err)]
pub async fn migrate(pool: &SqlitePool) -> Result<MigrationReport, StoreError> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| StoreError::sqlx("migrate_acquire", e))?;

    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::sqlx("migrate_begin", e))?;

    match apply(&mut conn).await {
        Ok(report) => {
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(|e| StoreError::sqlx("migrate_commit", e))?;
            if !report.added_columns.is_empty() {
                info!(columns = ?report.added_columns, "jobs table upgraded in place");
            }
            Ok(report)
        }
        Err(err) => {
            rollback_or_discard(conn).await;
            Err(err)
        }
    }
}

/// Roll back the migration transaction. A connection whose rollback failed
/// may still hold the write lock, so it is closed instead of going back to
/// the pool.
async fn rollback_or_discard(mut conn: PoolConnection<Sqlite>) {
    if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        warn!(error = %err, "migration rollback failed; discarding connection");
        if let Err(err) = conn.detach().close().await {
            warn!(error = %err, "closing discarded migration connection failed");
        }
    }
}

async fn apply(conn: &mut SqliteConnection) -> Result<MigrationReport, StoreError> {
    sqlx::query(BASE_SCHEMA_SQL)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::sqlx("create_jobs_table", e))?;

    let existing = existing_columns(conn).await?;
    let mut report = MigrationReport::default();

    for &(name, decl) in ADDITIVE_COLUMNS {
        if existing.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            continue;
        }
        sqlx::query(&format!("ALTER TABLE jobs ADD COLUMN {name} {decl}"))
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::sqlx("add_column", e))?;
        report.added_columns.push(name);
    }

    sqlx::query(INDEX_SQL)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::sqlx("create_indexes", e))?;

    sqlx::query(IDEMPOTENCY_INDEX_SQL)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            let err = StoreError::sqlx("create_idempotency_index", e);
            if err.is_constraint_violation() {
                StoreError::Migration(
                    "jobs table contains duplicate idempotency keys; resolve them before upgrading"
                        .to_string(),
                )
            } else {
                err
            }
        })?;

    Ok(report)
}

/// Column names of the `jobs` table, via `PRAGMA table_info`.
pub async fn existing_columns(conn: &mut SqliteConnection) -> Result<Vec<String>, StoreError> {
    let rows = sqlx::query("PRAGMA table_info(jobs)")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| StoreError::sqlx("table_info", e))?;

    rows.iter()
        .map(|row| {
            row.try_get::<String, _>("name")
                .map_err(|e| StoreError::decode(format!("table_info name: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn single_connection_pool(dir: &std::path::Path) -> SqlitePool {
        let options = SqliteConnectOptions::new()
            .filename(dir.join("jobs.db"))
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failed_migration_leaves_no_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let pool = single_connection_pool(dir.path()).await;
        sqlx::query(BASE_SCHEMA_SQL).execute(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO jobs(job_id, method, params_json, idempotency_key) \
             VALUES ('0123456789abcdef0123456789abcde1', 'a', '{}', 'dup'), \
                    ('0123456789abcdef0123456789abcde2', 'b', '{}', 'dup')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let err = migrate(&pool).await.unwrap_err();
        assert!(matches!(err, StoreError::Migration(_)), "got {err:?}");

        // The added columns were rolled back with the rest of the migration.
        let mut conn = pool.acquire().await.unwrap();
        let columns = existing_columns(&mut conn).await.unwrap();
        assert!(!columns.iter().any(|c| c == "rpc_id"));

        // The pooled connection is usable for a fresh write transaction.
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.unwrap();
        sqlx::query("ROLLBACK").execute(&mut *conn).await.unwrap();
    }

    #[tokio::test]
    async fn migration_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = single_connection_pool(dir.path()).await;

        let first = migrate(&pool).await.unwrap();
        assert_eq!(first.added_columns, vec!["rpc_id", "target_port", "claim_ts"]);
        assert_eq!(migrate(&pool).await.unwrap(), MigrationReport::default());
    }
}
