//! Queue metrics.
//!
//! Every queue call is recorded as a read or a write with its latency and
//! outcome; the reclaimer additionally counts timeouts, requeues and
//! dead-letters. Metrics live in a per-instance registry so several queues
//! (or tests) never share counters.

use std::time::Duration;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0,
];

/// Kind of storage call being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Read,
    Write,
}

impl CallKind {
    fn label(&self) -> &'static str {
        match self {
            CallKind::Read => "read",
            CallKind::Write => "write",
        }
    }
}

/// Point-in-time view of the queue metrics for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub failed_calls: u64,
    pub read_avg_ms: f64,
    pub write_avg_ms: f64,
    /// Successful calls over all calls; 1.0 before any call was made.
    pub success_rate: f64,
    pub timeouts: u64,
    pub requeues: u64,
    pub dead_letters: u64,
}

/// Counters and latency histograms for one queue instance.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    registry: Registry,
    calls: IntCounterVec,
    latency: HistogramVec,
    timeouts: IntCounter,
    requeues: IntCounter,
    dead_letters: IntCounter,
}

impl QueueMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("hostq".to_string()), None)?;

        let calls = IntCounterVec::new(
            Opts::new("queue_calls_total", "Queue storage calls by kind and outcome"),
            &["kind", "outcome"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("queue_call_duration_seconds", "Queue storage call latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["kind"],
        )?;
        let timeouts = IntCounter::new(
            "queue_timeouts_total",
            "Jobs moved to TIMEOUT after a liveness lapse",
        )?;
        let requeues = IntCounter::new(
            "queue_requeues_total",
            "FAILED/TIMEOUT jobs given another attempt",
        )?;
        let dead_letters = IntCounter::new(
            "queue_dead_letters_total",
            "Jobs moved to DEAD after exhausting their attempts",
        )?;

        registry.register(Box::new(calls.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(requeues.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;

        Ok(Self {
            registry,
            calls,
            latency,
            timeouts,
            requeues,
            dead_letters,
        })
    }

    /// Record one storage call.
    pub fn record_call(&self, kind: CallKind, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.calls
            .with_label_values(&[kind.label(), outcome])
            .inc();
        self.latency
            .with_label_values(&[kind.label()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_timeout(&self) {
        self.timeouts.inc();
    }

    pub fn record_requeue(&self) {
        self.requeues.inc();
    }

    pub fn record_dead_letter(&self) {
        self.dead_letters.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = |kind: CallKind, outcome: &str| {
            self.calls.with_label_values(&[kind.label(), outcome]).get()
        };
        let avg_ms = |kind: CallKind| {
            let hist = self.latency.with_label_values(&[kind.label()]);
            let samples = hist.get_sample_count();
            if samples == 0 {
                0.0
            } else {
                hist.get_sample_sum() * 1000.0 / samples as f64
            }
        };

        let read_ok = count(CallKind::Read, "success");
        let read_err = count(CallKind::Read, "failure");
        let write_ok = count(CallKind::Write, "success");
        let write_err = count(CallKind::Write, "failure");
        let total = read_ok + read_err + write_ok + write_err;
        let success_rate = if total == 0 {
            1.0
        } else {
            (read_ok + write_ok) as f64 / total as f64
        };

        MetricsSnapshot {
            reads: read_ok + read_err,
            writes: write_ok + write_err,
            failed_calls: read_err + write_err,
            read_avg_ms: avg_ms(CallKind::Read),
            write_avg_ms: avg_ms(CallKind::Write),
            success_rate,
            timeouts: self.timeouts.get(),
            requeues: self.requeues.get(),
            dead_letters: self.dead_letters.get(),
        }
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode_text(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
