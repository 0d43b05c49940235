//! Background loops driving the queue: the reclaimer and the reference
//! host executor.

pub mod executor;
pub mod reclaimer;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use executor::{CommandError, CommandHandler, FnHandler, JobOutcome, JobWorker, WorkerConfig};
pub use reclaimer::{ReclaimReport, Reclaimer, ReclaimerConfig};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: impl Into<String>, token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            token,
            join: Some(join),
        }
    }

    /// Token observed by the worker; cancelling it stops the loop.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = %self.name, error = %err, "worker task ended abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
