//! Circuit breaker for unrecoverable storage errors.
//!
//! A single halt flag plus a human-readable reason. Tripping is one-way:
//! the breaker stays open until an operator calls [`CircuitBreaker::reset`]
//! after remediation. While open, queue mutations are refused and health
//! reporting shows the queue as unhealthy.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub healthy: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Trip {
    reason: String,
    at: Option<DateTime<Utc>>,
}

/// Shared halt flag.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    trip: RwLock<Option<Trip>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the breaker. The first reason is kept until reset.
    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut guard = match self.trip.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(existing) => {
                error!(reason = %reason, first_reason = %existing.reason, "circuit breaker already tripped");
            }
            None => {
                error!(reason = %reason, "circuit breaker tripped; queue mutations halted");
                *guard = Some(Trip {
                    reason,
                    at: Some(Utc::now()),
                });
            }
        }
    }

    /// Close the breaker after remediation.
    pub fn reset(&self) {
        let mut guard = match self.trip.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = guard.take() {
            info!(reason = %previous.reason, "circuit breaker reset");
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.read(|trip| trip.is_some())
    }

    pub fn reason(&self) -> Option<String> {
        self.read(|trip| trip.map(|t| t.reason.clone()))
    }

    pub fn status(&self) -> BreakerStatus {
        self.read(|trip| BreakerStatus {
            healthy: trip.is_none(),
            reason: trip.map(|t| t.reason.clone()),
            tripped_at: trip.and_then(|t| t.at),
        })
    }

    fn read<T>(&self, f: impl FnOnce(Option<&Trip>) -> T) -> T {
        match self.trip.read() {
            Ok(guard) => f(guard.as_ref()),
            Err(poisoned) => f(poisoned.into_inner().as_ref()),
        }
    }
}
