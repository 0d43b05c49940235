//! Reference host executor.
//!
//! Runs the claim / start / heartbeat / complete-or-fail loop against a
//! registry of [`CommandHandler`]s, one job at a time. How a handler
//! reaches the host application is up to the handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostq_core::{Job, JobId, JobState};

use crate::queue::{QueueEngine, QueueError};

use super::WorkerHandle;

/// Error code recorded when no handler matches a job's method.
pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";

/// Business failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

impl CommandError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Executes one named host command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, CommandError>;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&Job) -> Result<Value, CommandError> + Send + Sync,
{
    async fn handle(&self, job: &Job) -> Result<Value, CommandError> {
        (self.0)(job)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
    /// Heartbeat period while a handler runs; keep well below job timeouts
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "host-worker".to_string(),
            poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// How a processed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub method: String,
    /// SUCCEEDED or FAILED
    pub state: JobState,
    pub heartbeats: u32,
}

/// Single-slot executor loop.
pub struct JobWorker {
    engine: QueueEngine,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(engine: QueueEngine, config: WorkerConfig) -> Self {
        Self {
            engine,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Register a handler for a method name, a `prefix.*` pattern, or `*`.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, f: F)
    where
        F: Fn(&Job) -> Result<Value, CommandError> + Send + Sync + 'static,
    {
        self.register(pattern, FnHandler::new(f));
    }

    fn handler_for(&self, method: &str) -> Option<Arc<dyn CommandHandler>> {
        if let Some(h) = self.handlers.get(method) {
            return Some(h.clone());
        }

        // Longest matching category wins ("export.pdf.*" over "export.*").
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = method.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());
        if category.is_some() {
            return category;
        }

        self.handlers.get("*").cloned()
    }

    /// Claim and execute at most one job.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.engine.claim().await? else {
            return Ok(None);
        };
        self.engine.start_running(job.job_id).await?;

        let Some(handler) = self.handler_for(&job.method) else {
            warn!(job_id = %job.job_id, method = %job.method, "no handler registered");
            self.engine
                .fail(
                    job.job_id,
                    UNKNOWN_METHOD,
                    &format!("no handler registered for {}", job.method),
                )
                .await?;
            return Ok(Some(JobOutcome {
                job_id: job.job_id,
                method: job.method,
                state: JobState::Failed,
                heartbeats: 0,
            }));
        };

        let (result, heartbeats) = self.execute(&job, handler.as_ref()).await;
        let state = match result {
            Ok(value) => {
                self.engine.complete(job.job_id, &value).await?;
                JobState::Succeeded
            }
            Err(err) => {
                debug!(job_id = %job.job_id, error = %err, "handler reported failure");
                self.engine.fail(job.job_id, &err.code, &err.message).await?;
                JobState::Failed
            }
        };

        Ok(Some(JobOutcome {
            job_id: job.job_id,
            method: job.method,
            state,
            heartbeats,
        }))
    }

    /// Drive the handler, heartbeating on an interval until it returns.
    async fn execute(
        &self,
        job: &Job,
        handler: &dyn CommandHandler,
    ) -> (Result<Value, CommandError>, u32) {
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        let mut work = handler.handle(job);
        let mut heartbeats = 0;

        loop {
            tokio::select! {
                result = &mut work => return (result, heartbeats),
                _ = ticker.tick() => match self.engine.heartbeat(job.job_id).await {
                    Ok(()) => heartbeats += 1,
                    Err(err) => warn!(job_id = %job.job_id, error = %err, "heartbeat failed"),
                },
            }
        }
    }

    /// Process jobs until `token` is cancelled. A job already running is
    /// finished before the loop exits.
    pub async fn run(&self, token: CancellationToken) {
        info!(worker = %self.config.name, handlers = self.handlers.len(), "worker started");

        while !token.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(Some(outcome)) => {
                    debug!(job_id = %outcome.job_id, state = %outcome.state, "job processed");
                    false
                }
                Ok(None) => true,
                Err(err) if err.is_transient() => {
                    debug!(error = %err, "worker hit lock contention");
                    true
                }
                Err(err) => {
                    warn!(worker = %self.config.name, error = %err, "worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.config.name, "worker stopped");
    }

    /// Run on a background task; cancelling `parent` also stops it.
    pub fn spawn(self, parent: &CancellationToken) -> WorkerHandle {
        let token = parent.child_token();
        let loop_token = token.clone();
        let name = self.config.name.clone();
        let join = tokio::spawn(async move { self.run(loop_token).await });
        WorkerHandle::new(name, token, join)
    }
}
