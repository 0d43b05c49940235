//! Infrastructure layer: SQLite job store, queue engine, background workers.
//!
//! - [`store`]: durable storage, schema migration, row codec
//! - [`queue`]: the queue engine and its port binding
//! - [`workers`]: reclaimer and reference host executor
//! - [`breaker`], [`correlation`]: shared collaborators passed via
//!   [`queue::QueueContext`]

pub mod breaker;
pub mod config;
pub mod correlation;
pub mod queue;
pub mod store;
pub mod workers;

mod integration_tests;

pub use breaker::{BreakerStatus, CircuitBreaker};
pub use config::{ConfigError, QueueConfig};
pub use correlation::CorrelationIndex;
pub use queue::{
    Enqueued, QueueContext, QueueEngine, QueueError, QueueStatus, StateCounts, WorkerBinding,
};
pub use store::{JobStore, StoreError};
pub use workers::{
    CommandError, CommandHandler, JobWorker, ReclaimReport, Reclaimer, ReclaimerConfig,
    WorkerConfig, WorkerHandle,
};
