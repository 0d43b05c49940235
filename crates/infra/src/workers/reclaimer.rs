//! Reclaimer: recovers jobs whose worker stopped reporting liveness and
//! settles jobs waiting for a retry decision.
//!
//! Each tick:
//!
//! 1. RUNNING and DISPATCHING jobs whose liveness anchor is older than
//!    `timeout_sec` are moved to TIMEOUT, most overdue first (the attempt
//!    is counted).
//! 2. FAILED and TIMEOUT jobs are requeued while `attempts < max_attempts`
//!    and dead-lettered otherwise.
//!
//! Lock contention aborts the tick quietly and is retried on the next one.
//! A job another actor moved first is skipped. Any other storage error trips
//! the circuit breaker; the loop keeps polling but mutates nothing until an
//! operator resets the breaker.

use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostq_core::{Job, JobState, RetryDecision};

use crate::config::QueueConfig;
use crate::queue::{QueueEngine, QueueError};

use super::WorkerHandle;

const DEFAULT_DEAD_CODE: &str = "MAX_ATTEMPTS";
const DEFAULT_DEAD_MESSAGE: &str = "attempts exhausted";
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    pub poll_interval: Duration,
    /// Rows examined per state per tick
    pub batch_limit: u32,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_limit: 500,
        }
    }
}

impl ReclaimerConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            poll_interval: config.reclaim_interval,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_limit(mut self, limit: u32) -> Self {
        self.batch_limit = limit;
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub timed_out: usize,
    pub requeued: usize,
    pub dead: usize,
    /// Jobs another actor moved between scan and update
    pub skipped: usize,
    /// The breaker was open; nothing was mutated
    pub halted: bool,
}

impl ReclaimReport {
    pub fn changed_anything(&self) -> bool {
        self.timed_out + self.requeued + self.dead > 0
    }
}

pub struct Reclaimer {
    engine: QueueEngine,
    config: ReclaimerConfig,
}

impl Reclaimer {
    pub fn new(engine: QueueEngine, config: ReclaimerConfig) -> Self {
        Self { engine, config }
    }

    /// One scan over in-progress and retry-pending jobs.
    ///
    /// Lost races are absorbed; every other error is returned to the caller.
    pub async fn tick(&self) -> Result<ReclaimReport, QueueError> {
        let ctx = self.engine.context();
        let mut report = ReclaimReport::default();
        if ctx.breaker.is_tripped() {
            report.halted = true;
            return Ok(report);
        }

        for job in self.engine.list_lapsed(self.config.batch_limit).await? {
            match self.engine.timeout(job.job_id).await {
                Ok(true) => {
                    report.timed_out += 1;
                    ctx.metrics.record_timeout();
                    warn!(
                        job_id = %job.job_id,
                        method = %job.method,
                        state = %job.state,
                        timeout_sec = job.timeout_sec,
                        "job liveness lapsed; marked TIMEOUT"
                    );
                }
                Ok(false) => debug!(job_id = %job.job_id, "liveness renewed before timeout"),
                Err(err) if err.is_lost_race() => {
                    report.skipped += 1;
                    debug!(job_id = %job.job_id, error = %err, "job moved before timeout");
                }
                Err(err) => return Err(err),
            }
        }

        for state in [JobState::Timeout, JobState::Failed] {
            for job in self.engine.list(state, self.config.batch_limit).await? {
                match self.settle(&job).await {
                    Ok(RetryDecision::Requeue) => report.requeued += 1,
                    Ok(RetryDecision::Dead) => report.dead += 1,
                    Err(err) if err.is_lost_race() => {
                        report.skipped += 1;
                        debug!(job_id = %job.job_id, error = %err, "job moved before retry decision");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(report)
    }

    async fn settle(&self, job: &Job) -> Result<RetryDecision, QueueError> {
        let metrics = &self.engine.context().metrics;
        let decision = job.retry_decision();
        match decision {
            RetryDecision::Requeue => {
                self.engine.requeue(job.job_id).await?;
                metrics.record_requeue();
                info!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    "job requeued"
                );
            }
            RetryDecision::Dead => {
                let code = job.error_code.as_deref().unwrap_or(DEFAULT_DEAD_CODE);
                let message = job.error_msg.as_deref().unwrap_or(DEFAULT_DEAD_MESSAGE);
                self.engine.dead(job.job_id, code, message).await?;
                metrics.record_dead_letter();
                warn!(
                    job_id = %job.job_id,
                    method = %job.method,
                    attempts = job.attempts,
                    code,
                    "job dead-lettered; manual intervention required"
                );
            }
        }
        Ok(decision)
    }

    /// Run one tick and classify its outcome.
    pub async fn run_once(&self) -> ReclaimReport {
        match self.tick().await {
            Ok(report) => {
                if report.changed_anything() {
                    info!(
                        timed_out = report.timed_out,
                        requeued = report.requeued,
                        dead = report.dead,
                        "reclaimer tick"
                    );
                }
                report
            }
            Err(err) if err.is_transient() => {
                debug!(error = %err, "reclaimer hit lock contention; retrying next tick");
                ReclaimReport::default()
            }
            Err(QueueError::Halted { .. }) => ReclaimReport {
                halted: true,
                ..ReclaimReport::default()
            },
            Err(err) => {
                self.engine
                    .context()
                    .breaker
                    .trip(format!("reclaimer: {err}"));
                ReclaimReport {
                    halted: true,
                    ..ReclaimReport::default()
                }
            }
        }
    }

    /// Poll until `token` is cancelled. The first tick runs immediately.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.config.poll_interval.as_millis() as u64, "reclaimer started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }

        info!("reclaimer stopped");
    }

    /// Run on a background task; cancelling `parent` also stops it.
    pub fn spawn(self, parent: &CancellationToken) -> WorkerHandle {
        let token = parent.child_token();
        let loop_token = token.clone();
        let join = tokio::spawn(async move { self.run(loop_token).await });
        WorkerHandle::new("reclaimer", token, join)
    }
}
