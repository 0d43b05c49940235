use thiserror::Error;

use hostq_core::{DomainError, JobId, JobState};

use crate::store::StoreError;

/// Errors surfaced by [`QueueEngine`](super::QueueEngine) operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("cannot {operation} job {job_id} in state {state}")]
    InvalidTransition {
        job_id: JobId,
        operation: &'static str,
        state: JobState,
    },

    #[error("queue halted: {reason}")]
    Halted { reason: String },

    #[error("metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl QueueError {
    pub(crate) fn sqlx(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| QueueError::Store(StoreError::sqlx(operation, source))
    }

    /// Lock contention that should be retried later rather than escalated.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Another actor moved the job first (or it no longer exists).
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            QueueError::NotFound(_) | QueueError::InvalidTransition { .. }
        )
    }
}
