//! Job record, lifecycle states and enqueue requests.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Priority assigned when the caller does not choose one (lower runs first).
pub const DEFAULT_PRIORITY: i32 = 100;
/// Per-attempt liveness budget when the caller does not choose one.
pub const DEFAULT_TIMEOUT_SEC: u32 = 60;
/// Attempts allowed before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job lifecycle state.
///
/// ```text
/// ENQUEUED --claim--> DISPATCHING --start_running--> RUNNING
/// RUNNING --complete--> SUCCEEDED
/// RUNNING --fail--> FAILED
/// RUNNING | DISPATCHING --(lapse, reclaimer)--> TIMEOUT
/// FAILED | TIMEOUT --requeue--> ENQUEUED
/// FAILED | TIMEOUT --dead--> DEAD
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting to be claimed
    Enqueued,
    /// Claimed by a worker, host invocation not yet started
    Dispatching,
    /// Host is executing the command
    Running,
    /// Completed successfully (terminal)
    Succeeded,
    /// Business failure, awaiting retry decision
    Failed,
    /// Liveness lapsed, awaiting retry decision
    Timeout,
    /// Retries exhausted (terminal)
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Enqueued,
        JobState::Dispatching,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Timeout,
        JobState::Dead,
    ];

    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Enqueued => "ENQUEUED",
            JobState::Dispatching => "DISPATCHING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Dead)
    }

    /// Held by a worker (claimed or executing).
    pub fn is_in_progress(&self) -> bool {
        matches!(self, JobState::Dispatching | JobState::Running)
    }

    /// Ended an attempt without success; the reclaimer decides what happens next.
    pub fn awaits_retry_decision(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Timeout)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| DomainError::unknown_state(raw))
    }
}

/// Lifecycle timestamp columns usable for "latest job" lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTimestamp {
    Enqueue,
    Claim,
    Start,
    Heartbeat,
    Finish,
}

impl JobTimestamp {
    /// Column name in the persisted row.
    pub fn column(&self) -> &'static str {
        match self {
            JobTimestamp::Enqueue => "enqueue_ts",
            JobTimestamp::Claim => "claim_ts",
            JobTimestamp::Start => "start_ts",
            JobTimestamp::Heartbeat => "heartbeat_ts",
            JobTimestamp::Finish => "finish_ts",
        }
    }
}

/// Where an enqueued job may be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPort {
    /// Use the enqueuing engine's bound port (wildcard when unbound).
    #[default]
    Inherit,
    /// Legacy wildcard: claimable by any worker.
    Wildcard,
    /// Only workers bound to this port (or unbound workers) may claim it.
    Exact(u16),
}

/// Outcome of the reclaimer's retry accounting for a FAILED/TIMEOUT job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue,
    Dead,
}

impl RetryDecision {
    pub fn for_attempts(attempts: u32, max_attempts: u32) -> Self {
        if attempts < max_attempts {
            RetryDecision::Requeue
        } else {
            RetryDecision::Dead
        }
    }
}

/// Request to enqueue a named host command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub method: String,
    pub params: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub rpc_id: Option<String>,
    pub priority: i32,
    pub timeout_sec: u32,
    pub max_attempts: u32,
    pub target_port: TargetPort,
}

impl EnqueueRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            params,
            idempotency_key: None,
            rpc_id: None,
            priority: DEFAULT_PRIORITY,
            timeout_sec: DEFAULT_TIMEOUT_SEC,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            target_port: TargetPort::Inherit,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_rpc_id(mut self, rpc_id: impl Into<String>) -> Self {
        self.rpc_id = Some(rpc_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_sec(mut self, timeout_sec: u32) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_target_port(mut self, target: TargetPort) -> Self {
        self.target_port = target;
        self
    }

    /// Check the request before it touches storage.
    ///
    /// Blank idempotency keys and correlation ids are treated as absent.
    pub fn validate(mut self) -> DomainResult<Self> {
        self.method = self.method.trim().to_string();
        if self.method.is_empty() {
            return Err(DomainError::validation("method must not be empty"));
        }
        if self.timeout_sec == 0 {
            return Err(DomainError::validation("timeout_sec must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if let TargetPort::Exact(0) = self.target_port {
            return Err(DomainError::validation("target port must be in 1..=65535"));
        }
        self.idempotency_key = non_blank(self.idempotency_key);
        self.rpc_id = non_blank(self.rpc_id);
        Ok(self)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Command name, opaque to the queue
    pub method: String,
    /// Serialized command arguments
    pub params: serde_json::Value,
    /// Correlation id used for request coalescing
    pub rpc_id: Option<String>,
    pub idempotency_key: Option<String>,
    /// Lower value is claimed first
    pub priority: i32,
    /// Per-attempt liveness budget
    pub timeout_sec: u32,
    pub attempts: u32,
    pub max_attempts: u32,
    /// `None` is the legacy wildcard (claimable by any worker)
    pub target_port: Option<u16>,
    pub state: JobState,
    pub enqueue_ts: DateTime<Utc>,
    pub claim_ts: Option<DateTime<Utc>>,
    pub start_ts: Option<DateTime<Utc>>,
    pub heartbeat_ts: Option<DateTime<Utc>>,
    pub finish_ts: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

impl Job {
    /// The timestamp liveness is measured from for an in-progress job.
    ///
    /// RUNNING jobs use the later of heartbeat and start; DISPATCHING jobs
    /// use the claim time. Other states have no liveness.
    pub fn liveness_anchor(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::Running => match (self.heartbeat_ts, self.start_ts) {
                (Some(hb), Some(start)) => Some(hb.max(start)),
                (hb, start) => hb.or(start).or(self.claim_ts).or(Some(self.enqueue_ts)),
            },
            JobState::Dispatching => self
                .claim_ts
                .or(self.start_ts)
                .or(Some(self.enqueue_ts)),
            _ => None,
        }
    }

    /// Time elapsed since the last liveness signal.
    pub fn liveness_lag(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.liveness_anchor().map(|anchor| now - anchor)
    }

    /// True when an in-progress job has exceeded its `timeout_sec` budget.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.liveness_lag(now)
            .is_some_and(|lag| lag > Duration::seconds(i64::from(self.timeout_sec)))
    }

    pub fn retry_decision(&self) -> RetryDecision {
        RetryDecision::for_attempts(self.attempts, self.max_attempts)
    }

    /// Claimable by workers bound to any port.
    pub fn is_wildcard_target(&self) -> bool {
        self.target_port.is_none()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary::from(self)
    }
}

/// A job row without its payloads, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub rpc_id: Option<String>,
    pub method: String,
    pub state: JobState,
    pub priority: i32,
    pub timeout_sec: u32,
    pub attempts: u32,
    pub target_port: Option<u16>,
    pub enqueue_ts: DateTime<Utc>,
    pub start_ts: Option<DateTime<Utc>>,
    pub heartbeat_ts: Option<DateTime<Utc>>,
    pub finish_ts: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            rpc_id: job.rpc_id.clone(),
            method: job.method.clone(),
            state: job.state,
            priority: job.priority,
            timeout_sec: job.timeout_sec,
            attempts: job.attempts,
            target_port: job.target_port,
            enqueue_ts: job.enqueue_ts,
            start_ts: job.start_ts,
            heartbeat_ts: job.heartbeat_ts,
            finish_ts: job.finish_ts,
            error_code: job.error_code.clone(),
            error_msg: job.error_msg.clone(),
        }
    }
}
