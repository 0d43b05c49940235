//! Aggregate views for health and status reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use hostq_core::{JobState, JobSummary};
use hostq_observability::MetricsSnapshot;

/// Job counts per state. States with no rows are reported as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StateCounts(BTreeMap<JobState, u64>);

impl StateCounts {
    pub(crate) fn insert(&mut self, state: JobState, count: u64) {
        *self.0.entry(state).or_default() += count;
    }

    pub fn get(&self, state: JobState) -> u64 {
        self.0.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobState, u64)> + '_ {
        JobState::ALL.into_iter().map(|state| (state, self.get(state)))
    }
}

/// Point-in-time queue report for an external status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub port: Option<u16>,
    pub healthy: bool,
    pub halt_reason: Option<String>,
    pub counts: StateCounts,
    pub queued: u64,
    pub dispatching: u64,
    pub running: u64,
    /// Most recently started in-progress job
    pub active_job: Option<JobSummary>,
    /// Most recently finished failed/timed-out/dead job
    pub last_error: Option<JobSummary>,
    pub metrics: MetricsSnapshot,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_states_count_as_zero() {
        let mut counts = StateCounts::default();
        counts.insert(JobState::Enqueued, 3);
        counts.insert(JobState::Dead, 1);

        assert_eq!(counts.get(JobState::Enqueued), 3);
        assert_eq!(counts.get(JobState::Running), 0);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.iter().count(), JobState::ALL.len());
    }

    #[test]
    fn serializes_as_state_map() {
        let mut counts = StateCounts::default();
        counts.insert(JobState::Failed, 2);
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json, serde_json::json!({ "FAILED": 2 }));
    }
}
