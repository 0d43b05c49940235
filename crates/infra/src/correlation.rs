//! Correlation index: process-local `rpc_id -> job_id` shortcut.
//!
//! Best effort only. A miss means "ask the store", never "no such job", and
//! entries vanish on restart or eviction without affecting correctness.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use hostq_core::JobId;

pub const DEFAULT_CORRELATION_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Entries {
    by_rpc: HashMap<String, JobId>,
    order: VecDeque<String>,
}

/// Bounded in-memory map with FIFO eviction.
#[derive(Debug)]
pub struct CorrelationIndex {
    capacity: usize,
    entries: RwLock<Entries>,
}

impl Default for CorrelationIndex {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CORRELATION_CAPACITY)
    }
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn record(&self, rpc_id: &str, job_id: JobId) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.by_rpc.insert(rpc_id.to_string(), job_id).is_none() {
            entries.order.push_back(rpc_id.to_string());
        }
        while entries.by_rpc.len() > self.capacity {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.by_rpc.remove(&oldest);
        }
    }

    pub fn lookup(&self, rpc_id: &str) -> Option<JobId> {
        match self.entries.read() {
            Ok(guard) => guard.by_rpc.get(rpc_id).copied(),
            Err(poisoned) => poisoned.into_inner().by_rpc.get(rpc_id).copied(),
        }
    }

    pub fn forget(&self, rpc_id: &str) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.by_rpc.remove(rpc_id).is_some() {
            entries.order.retain(|k| k != rpc_id);
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.by_rpc.len(),
            Err(poisoned) => poisoned.into_inner().by_rpc.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
