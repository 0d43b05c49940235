//! Storage error model.
//!
//! ## Error classification
//!
//! | Source | SQLite code | `is_transient()` | Scenario |
//! |--------|-------------|------------------|----------|
//! | Database | `SQLITE_BUSY` (5) and extended codes | yes | Another connection holds the write lock past `busy_timeout` |
//! | Database | `SQLITE_LOCKED` (6) and extended codes | yes | Shared-cache / same-connection lock conflict |
//! | PoolTimedOut | N/A | yes | Every pooled connection is busy |
//! | Database | anything else | no | Constraint, corruption, I/O, schema errors |
//! | Io / Decode / Migration | N/A | no | Filesystem or data problems |

use std::path::PathBuf;

use thiserror::Error;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT: i32 = 19;

/// Storage-layer error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error in {operation}: {source}")]
    Sqlx {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to prepare queue directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode job row: {0}")]
    Decode(String),

    #[error("schema migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn sqlx(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Sqlx { operation, source }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Lock contention that is expected to clear on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlx { source, .. } => is_transient_sqlx(source),
            _ => false,
        }
    }

    /// A uniqueness/constraint violation reported by SQLite.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StoreError::Sqlx { source, .. } => primary_code(source) == Some(SQLITE_CONSTRAINT),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        _ => matches!(primary_code(err), Some(SQLITE_BUSY | SQLITE_LOCKED)),
    }
}

/// SQLite reports extended result codes; the low byte is the primary code.
fn primary_code(err: &sqlx::Error) -> Option<i32> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        let err = StoreError::sqlx("claim", sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn data_problems_are_not_transient() {
        assert!(!StoreError::decode("bad state").is_transient());
        assert!(!StoreError::Migration("dup keys".into()).is_transient());
        assert!(!StoreError::sqlx("get", sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::sqlx("get", sqlx::Error::PoolClosed).is_transient());
    }
}
