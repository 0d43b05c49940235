//! Queue engine: the only API that creates and transitions jobs.
//!
//! Every operation is one short statement (or two, for idempotent enqueue)
//! against the [`JobStore`]. The database transaction is the only mutual
//! exclusion primitive, so the guarantees below hold across threads and
//! across processes sharing the same database file:
//!
//! - **Claim** is a single `UPDATE ... WHERE job_id = (SELECT ... LIMIT 1)
//!   AND state = 'ENQUEUED' RETURNING *`; no two callers can receive the same
//!   job.
//! - **Enqueue** with an idempotency key relies on a UNIQUE index and
//!   `ON CONFLICT DO NOTHING`, then reads back the winner's id.
//! - **Transitions** are guarded by `state IN (...)`; when nothing was
//!   updated the engine reports `NotFound` or `InvalidTransition` with the
//!   state it observed.
//!
//! While the shared [`CircuitBreaker`] is tripped every mutation fails with
//! [`QueueError::Halted`]; reads keep working.

mod binding;
mod error;
mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use hostq_core::{Clock, EnqueueRequest, Job, JobId, JobState, JobTimestamp};
use hostq_observability::{CallKind, QueueMetrics};

use crate::breaker::CircuitBreaker;
use crate::config::QueueConfig;
use crate::correlation::CorrelationIndex;
use crate::store::row::{encode_payload, encode_port, encode_ts, job_from_row};
use crate::store::{JobStore, StoreError};

pub use binding::WorkerBinding;
pub use error::QueueError;
pub use status::{QueueStatus, StateCounts};

/// Upper bound for [`QueueEngine::list`].
pub const MAX_LIST_LIMIT: u32 = 1000;

const INSERT_SQL: &str = r#"
INSERT INTO jobs (job_id, method, params_json, rpc_id, idempotency_key, priority, state,
                  enqueue_ts, timeout_sec, attempts, max_attempts, target_port)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'ENQUEUED', ?7, ?8, 0, ?9, ?10)
ON CONFLICT(idempotency_key) DO NOTHING
RETURNING job_id
"#;

/// Liveness anchor per state: RUNNING measures from the later of heartbeat
/// and start, DISPATCHING from the claim.
macro_rules! liveness_anchor {
    () => {
        "CASE WHEN state = 'RUNNING' \
              THEN MAX(COALESCE(heartbeat_ts, start_ts, claim_ts, enqueue_ts), \
                       COALESCE(start_ts, heartbeat_ts, claim_ts, enqueue_ts)) \
              ELSE COALESCE(claim_ts, start_ts, enqueue_ts) \
         END"
    };
}

const TIMEOUT_SQL: &str = concat!(
    "UPDATE jobs \
     SET state = 'TIMEOUT', \
         attempts = attempts + 1, \
         finish_ts = ?2, \
         error_code = 'TIMEOUT', \
         error_msg = CASE WHEN state = 'RUNNING' THEN 'heartbeat lost' ELSE 'claim lapsed before start' END \
     WHERE job_id = ?1 \
       AND state IN ('RUNNING', 'DISPATCHING') \
       AND (julianday(?2) - julianday(",
    liveness_anchor!(),
    ")) * 86400.0 > timeout_sec"
);

/// In-progress jobs past their liveness deadline, most overdue first.
const LAPSED_SQL: &str = concat!(
    "SELECT * FROM jobs \
     WHERE state IN ('RUNNING', 'DISPATCHING') \
       AND (julianday(?1) - julianday(",
    liveness_anchor!(),
    ")) * 86400.0 > timeout_sec \
     ORDER BY julianday(",
    liveness_anchor!(),
    ") + timeout_sec / 86400.0 ASC, rowid ASC \
     LIMIT ?2"
);

/// Process-wide collaborators shared by engines and background workers.
#[derive(Debug, Clone)]
pub struct QueueContext {
    pub clock: Clock,
    pub index: Arc<CorrelationIndex>,
    pub metrics: QueueMetrics,
    pub breaker: Arc<CircuitBreaker>,
}

impl QueueContext {
    pub fn new() -> Result<Self, QueueError> {
        Ok(Self {
            clock: Clock::system(),
            index: Arc::new(CorrelationIndex::new()),
            metrics: QueueMetrics::new()?,
            breaker: Arc::new(CircuitBreaker::new()),
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

/// Result of [`QueueEngine::enqueue_or_attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub job_id: JobId,
    /// True when an in-progress job with the same correlation id was reused.
    pub attached: bool,
}

/// Handle to the queue for one port binding. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueEngine {
    store: JobStore,
    binding: WorkerBinding,
    ctx: QueueContext,
}

impl QueueEngine {
    pub fn new(store: JobStore, binding: WorkerBinding, ctx: QueueContext) -> Self {
        Self {
            store,
            binding,
            ctx,
        }
    }

    /// Open the store for `config`'s port and bind an engine to it.
    pub async fn open(config: &QueueConfig, ctx: QueueContext) -> Result<Self, QueueError> {
        let store = JobStore::open(config).await?;
        Ok(Self::new(store, WorkerBinding::from_config(config), ctx))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn binding(&self) -> WorkerBinding {
        self.binding
    }

    pub fn context(&self) -> &QueueContext {
        &self.ctx
    }

    fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    fn now(&self) -> String {
        encode_ts(self.ctx.clock.now())
    }

    /// Create a job, or return the existing one for a repeated idempotency key.
    #[instrument(skip(self, request), fields(method = %request.method), err)]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        self.ensure_writable()?;
        let request = request.validate()?;
        self.tracked(CallKind::Write, self.insert_or_fetch(&request))
            .await
    }

    async fn insert_or_fetch(&self, request: &EnqueueRequest) -> Result<JobId, QueueError> {
        let candidate = JobId::new();
        let target_port = self.binding.resolve_target(request.target_port);

        let inserted: Option<String> = sqlx::query_scalar(INSERT_SQL)
            .bind(candidate.to_string())
            .bind(&request.method)
            .bind(encode_payload(&request.params))
            .bind(request.rpc_id.as_deref())
            .bind(request.idempotency_key.as_deref())
            .bind(request.priority)
            .bind(self.now())
            .bind(i64::from(request.timeout_sec))
            .bind(i64::from(request.max_attempts))
            .bind(encode_port(target_port))
            .fetch_optional(self.pool())
            .await
            .map_err(QueueError::sqlx("enqueue"))?;

        let job_id = match (inserted, request.idempotency_key.as_deref()) {
            (Some(_), _) => {
                info!(job_id = %candidate, port = ?target_port, priority = request.priority, "job enqueued");
                candidate
            }
            (None, Some(key)) => {
                let existing: Option<String> =
                    sqlx::query_scalar("SELECT job_id FROM jobs WHERE idempotency_key = ?1")
                        .bind(key)
                        .fetch_optional(self.pool())
                        .await
                        .map_err(QueueError::sqlx("enqueue_existing"))?;
                let existing = existing.ok_or_else(|| {
                    StoreError::decode(format!("idempotency key {key:?} conflicted but no row holds it"))
                })?;
                let job_id: JobId = existing.parse()?;
                debug!(job_id = %job_id, "idempotency key matched existing job");
                job_id
            }
            (None, None) => {
                return Err(StoreError::decode("insert returned no row without an idempotency key").into());
            }
        };

        if let Some(rpc_id) = request.rpc_id.as_deref() {
            self.ctx.index.record(rpc_id, job_id);
        }
        Ok(job_id)
    }

    /// Attach to an in-progress job with the same correlation id, or enqueue.
    pub async fn enqueue_or_attach(&self, request: EnqueueRequest) -> Result<Enqueued, QueueError> {
        if let Some(rpc_id) = request.rpc_id.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            if let Some(job_id) = self.find_running_job_by_correlation_id(rpc_id).await? {
                info!(job_id = %job_id, rpc_id, "attached to in-progress job");
                return Ok(Enqueued {
                    job_id,
                    attached: true,
                });
            }
        }
        let job_id = self.enqueue(request).await?;
        Ok(Enqueued {
            job_id,
            attached: false,
        })
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        self.tracked(CallKind::Read, async {
            let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
                .bind(job_id.to_string())
                .fetch_optional(self.pool())
                .await
                .map_err(QueueError::sqlx("get"))?;
            Ok(row.map(|r| job_from_row(&r)).transpose()?)
        })
        .await
    }

    /// Jobs in `state`, claim order first. `limit` is clamped to `1..=1000`.
    pub async fn list(&self, state: JobState, limit: u32) -> Result<Vec<Job>, QueueError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.tracked(CallKind::Read, async {
            let rows = sqlx::query(
                "SELECT * FROM jobs WHERE state = ?1 ORDER BY priority ASC, enqueue_ts ASC, rowid ASC LIMIT ?2",
            )
            .bind(state.as_str())
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await
            .map_err(QueueError::sqlx("list"))?;
            rows.iter()
                .map(|r| job_from_row(r).map_err(QueueError::from))
                .collect()
        })
        .await
    }

    /// RUNNING/DISPATCHING jobs whose liveness has lapsed at the engine clock,
    /// most overdue first. `limit` is clamped like [`QueueEngine::list`].
    pub async fn list_lapsed(&self, limit: u32) -> Result<Vec<Job>, QueueError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.tracked(CallKind::Read, async {
            let rows = sqlx::query(LAPSED_SQL)
                .bind(self.now())
                .bind(i64::from(limit))
                .fetch_all(self.pool())
                .await
                .map_err(QueueError::sqlx("list_lapsed"))?;
            rows.iter()
                .map(|r| job_from_row(r).map_err(QueueError::from))
                .collect()
        })
        .await
    }

    /// Atomically move the next eligible ENQUEUED job to DISPATCHING.
    #[instrument(skip(self), fields(port = ?self.binding.bound_port()), err)]
    pub async fn claim(&self) -> Result<Option<Job>, QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let scope = self.binding.scope();
            let sql = format!(
                "UPDATE jobs SET state = 'DISPATCHING', claim_ts = ?1 \
                 WHERE job_id = (SELECT job_id FROM jobs WHERE state = 'ENQUEUED'{filter} \
                                 ORDER BY {order} LIMIT 1) \
                 AND state = 'ENQUEUED' RETURNING *",
                filter = scope.filter(2),
                order = scope.claim_order(2),
            );
            let mut query = sqlx::query(&sql).bind(self.now());
            if let Some(port) = scope.port() {
                query = query.bind(i64::from(port));
            }
            let row = query
                .fetch_optional(self.pool())
                .await
                .map_err(QueueError::sqlx("claim"))?;
            let job = row.map(|r| job_from_row(&r)).transpose()?;
            if let Some(job) = &job {
                debug!(job_id = %job.job_id, method = %job.method, "job claimed");
            }
            Ok(job)
        })
        .await
    }

    /// DISPATCHING -> RUNNING once the host invocation has begun.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn start_running(&self, job_id: JobId) -> Result<(), QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let done = sqlx::query(
                "UPDATE jobs SET state = 'RUNNING', start_ts = ?2, heartbeat_ts = ?2 \
                 WHERE job_id = ?1 AND state = 'DISPATCHING'",
            )
            .bind(job_id.to_string())
            .bind(self.now())
            .execute(self.pool())
            .await
            .map_err(QueueError::sqlx("start_running"))?;
            self.expect_applied("start", job_id, done.rows_affected()).await
        })
        .await
    }

    /// Renew the liveness signal of a RUNNING job.
    pub async fn heartbeat(&self, job_id: JobId) -> Result<(), QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let done = sqlx::query(
                "UPDATE jobs SET heartbeat_ts = ?2 WHERE job_id = ?1 AND state = 'RUNNING'",
            )
            .bind(job_id.to_string())
            .bind(self.now())
            .execute(self.pool())
            .await
            .map_err(QueueError::sqlx("heartbeat"))?;
            self.expect_applied("heartbeat", job_id, done.rows_affected()).await
        })
        .await
    }

    /// RUNNING -> SUCCEEDED with `result`; clears error fields.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn complete(&self, job_id: JobId, result: &Value) -> Result<(), QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let done = sqlx::query(
                "UPDATE jobs SET state = 'SUCCEEDED', result_json = ?2, finish_ts = ?3, \
                 error_code = NULL, error_msg = NULL \
                 WHERE job_id = ?1 AND state = 'RUNNING'",
            )
            .bind(job_id.to_string())
            .bind(encode_payload(result))
            .bind(self.now())
            .execute(self.pool())
            .await
            .map_err(QueueError::sqlx("complete"))?;
            self.expect_applied("complete", job_id, done.rows_affected()).await?;
            debug!("job succeeded");
            Ok(())
        })
        .await
    }

    /// RUNNING -> FAILED; counts the attempt.
    #[instrument(skip_all, fields(job_id = %job_id, code = %code))]
    pub async fn fail(&self, job_id: JobId, code: &str, message: &str) -> Result<(), QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let done = sqlx::query(
                "UPDATE jobs SET state = 'FAILED', attempts = attempts + 1, finish_ts = ?2, \
                 error_code = ?3, error_msg = ?4 \
                 WHERE job_id = ?1 AND state = 'RUNNING'",
            )
            .bind(job_id.to_string())
            .bind(self.now())
            .bind(code)
            .bind(message)
            .execute(self.pool())
            .await
            .map_err(QueueError::sqlx("fail"))?;
            self.expect_applied("fail", job_id, done.rows_affected()).await?;
            debug!("job failed");
            Ok(())
        })
        .await
    }

    /// RUNNING/DISPATCHING -> TIMEOUT when liveness has lapsed; counts the attempt.
    ///
    /// Returns `false` when the job is still in progress but was renewed
    /// since the caller looked at it.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn timeout(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let done = sqlx::query(TIMEOUT_SQL)
                .bind(job_id.to_string())
                .bind(self.now())
                .execute(self.pool())
                .await
                .map_err(QueueError::sqlx("timeout"))?;
            if done.rows_affected() > 0 {
                return Ok(true);
            }
            match self.current_state(job_id).await? {
                None => Err(QueueError::NotFound(job_id)),
                Some(state) if state.is_in_progress() => Ok(false),
                Some(state) => Err(QueueError::InvalidTransition {
                    job_id,
                    operation: "time out",
                    state,
                }),
            }
        })
        .await
    }

    /// FAILED/TIMEOUT -> ENQUEUED for another attempt. Attempts are kept.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn requeue(&self, job_id: JobId) -> Result<(), QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let done = sqlx::query(
                "UPDATE jobs SET state = 'ENQUEUED', claim_ts = NULL, start_ts = NULL, \
                 heartbeat_ts = NULL, finish_ts = NULL \
                 WHERE job_id = ?1 AND state IN ('FAILED', 'TIMEOUT')",
            )
            .bind(job_id.to_string())
            .execute(self.pool())
            .await
            .map_err(QueueError::sqlx("requeue"))?;
            self.expect_applied("requeue", job_id, done.rows_affected()).await
        })
        .await
    }

    /// FAILED/TIMEOUT -> DEAD. Terminal.
    #[instrument(skip_all, fields(job_id = %job_id, code = %code))]
    pub async fn dead(&self, job_id: JobId, code: &str, message: &str) -> Result<(), QueueError> {
        self.ensure_writable()?;
        self.tracked(CallKind::Write, async {
            let done = sqlx::query(
                "UPDATE jobs SET state = 'DEAD', finish_ts = ?2, error_code = ?3, error_msg = ?4 \
                 WHERE job_id = ?1 AND state IN ('FAILED', 'TIMEOUT')",
            )
            .bind(job_id.to_string())
            .bind(self.now())
            .bind(code)
            .bind(message)
            .execute(self.pool())
            .await
            .map_err(QueueError::sqlx("dead"))?;
            self.expect_applied("dead-letter", job_id, done.rows_affected()).await
        })
        .await
    }

    /// In-progress job for a correlation id, if any.
    ///
    /// The correlation index is consulted first; a hit is confirmed against
    /// the store and a miss falls through to a store query.
    pub async fn find_running_job_by_correlation_id(
        &self,
        rpc_id: &str,
    ) -> Result<Option<JobId>, QueueError> {
        let rpc_id = rpc_id.trim();
        if rpc_id.is_empty() {
            return Ok(None);
        }
        self.tracked(CallKind::Read, async {
            if let Some(job_id) = self.ctx.index.lookup(rpc_id) {
                match self.current_state(job_id).await? {
                    Some(state) if state.is_in_progress() => return Ok(Some(job_id)),
                    _ => self.ctx.index.forget(rpc_id),
                }
            }

            let found: Option<String> = sqlx::query_scalar(
                "SELECT job_id FROM jobs WHERE rpc_id = ?1 AND state IN ('RUNNING', 'DISPATCHING') \
                 ORDER BY COALESCE(start_ts, claim_ts, enqueue_ts) DESC, rowid DESC LIMIT 1",
            )
            .bind(rpc_id)
            .fetch_optional(self.pool())
            .await
            .map_err(QueueError::sqlx("find_by_correlation_id"))?;

            match found {
                Some(raw) => {
                    let job_id: JobId = raw.parse()?;
                    self.ctx.index.record(rpc_id, job_id);
                    Ok(Some(job_id))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Job counts per state, scoped to this engine's port.
    pub async fn count_by_state(&self) -> Result<StateCounts, QueueError> {
        self.tracked(CallKind::Read, async {
            let scope = self.binding.scope();
            let sql = format!(
                "SELECT state, COUNT(*) AS cnt FROM jobs WHERE 1 = 1{} GROUP BY state",
                scope.filter(1)
            );
            let mut query = sqlx::query(&sql);
            if let Some(port) = scope.port() {
                query = query.bind(i64::from(port));
            }
            let rows = query
                .fetch_all(self.pool())
                .await
                .map_err(QueueError::sqlx("count_by_state"))?;

            let mut counts = StateCounts::default();
            for row in rows {
                let state: String = row.try_get("state").map_err(QueueError::sqlx("count_by_state"))?;
                let count: i64 = row.try_get("cnt").map_err(QueueError::sqlx("count_by_state"))?;
                counts.insert(state.parse()?, u64::try_from(count).unwrap_or(0));
            }
            Ok(counts)
        })
        .await
    }

    /// Most recent job in any of `states` by the `order` timestamp, scoped to
    /// this engine's port.
    pub async fn latest_job_by_states(
        &self,
        states: &[JobState],
        order: JobTimestamp,
    ) -> Result<Option<Job>, QueueError> {
        if states.is_empty() {
            return Ok(None);
        }
        self.tracked(CallKind::Read, async {
            let scope = self.binding.scope();
            let in_list = states
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT * FROM jobs WHERE state IN ({in_list}){filter} \
                 ORDER BY {column} DESC, rowid DESC LIMIT 1",
                filter = scope.filter(1),
                column = order.column(),
            );
            let mut query = sqlx::query(&sql);
            if let Some(port) = scope.port() {
                query = query.bind(i64::from(port));
            }
            let row = query
                .fetch_optional(self.pool())
                .await
                .map_err(QueueError::sqlx("latest_job_by_states"))?;
            Ok(row.map(|r| job_from_row(&r)).transpose()?)
        })
        .await
    }

    /// Health and progress report for an external status endpoint.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let counts = self.count_by_state().await?;
        let active_job = self
            .latest_job_by_states(&[JobState::Running, JobState::Dispatching], JobTimestamp::Start)
            .await?;
        let last_error = self
            .latest_job_by_states(
                &[JobState::Failed, JobState::Timeout, JobState::Dead],
                JobTimestamp::Finish,
            )
            .await?;
        let breaker = self.ctx.breaker.status();

        Ok(QueueStatus {
            port: self.binding.bound_port(),
            healthy: breaker.healthy,
            halt_reason: breaker.reason,
            queued: counts.get(JobState::Enqueued),
            dispatching: counts.get(JobState::Dispatching),
            running: counts.get(JobState::Running),
            counts,
            active_job: active_job.as_ref().map(Job::summary),
            last_error: last_error.as_ref().map(Job::summary),
            metrics: self.ctx.metrics.snapshot(),
            generated_at: self.ctx.clock.now(),
        })
    }

    fn ensure_writable(&self) -> Result<(), QueueError> {
        match self.ctx.breaker.reason() {
            Some(reason) => Err(QueueError::Halted { reason }),
            None => Ok(()),
        }
    }

    async fn tracked<T>(
        &self,
        kind: CallKind,
        call: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        let started = Instant::now();
        let result = call.await;
        let success = match &result {
            Ok(_) => true,
            Err(err) => err.is_lost_race(),
        };
        self.ctx.metrics.record_call(kind, started.elapsed(), success);
        result
    }

    async fn current_state(&self, job_id: JobId) -> Result<Option<JobState>, QueueError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(QueueError::sqlx("current_state"))?;
        Ok(raw.map(|s| s.parse()).transpose()?)
    }

    async fn expect_applied(
        &self,
        operation: &'static str,
        job_id: JobId,
        rows_affected: u64,
    ) -> Result<(), QueueError> {
        if rows_affected > 0 {
            return Ok(());
        }
        match self.current_state(job_id).await? {
            None => Err(QueueError::NotFound(job_id)),
            Some(state) => Err(QueueError::InvalidTransition {
                job_id,
                operation,
                state,
            }),
        }
    }
}
