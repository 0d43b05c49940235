//! `hostq-core`: job model for the durable host command queue.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! the job record, its lifecycle states, enqueue requests and retry policy.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;

pub use clock::Clock;
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_TIMEOUT_SEC, EnqueueRequest, Job, JobState,
    JobSummary, JobTimestamp, RetryDecision, TargetPort,
};
