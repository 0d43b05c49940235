//! Integration tests for the full queue pipeline.
//!
//! Tests: Enqueue → Claim → Executor → Reclaimer → Store
//!
//! Verifies:
//! - A job that keeps losing liveness or failing ends up DEAD with its
//!   attempts accounted for
//! - Jobs and idempotency keys survive a process restart
//! - Per-port instances are isolated on disk

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use hostq_core::{Clock, EnqueueRequest, JobState};

    use crate::config::QueueConfig;
    use crate::queue::{QueueContext, QueueEngine};
    use crate::workers::{CommandError, JobWorker, Reclaimer, ReclaimerConfig, WorkerConfig};

    fn manual_context() -> (QueueContext, Clock) {
        hostq_observability::tracing::init_for_tests();
        let clock = Clock::manual(Utc.with_ymd_and_hms(2024, 9, 2, 7, 30, 0).unwrap());
        (QueueContext::new().unwrap().with_clock(clock.clone()), clock)
    }

    fn config_in(dir: &std::path::Path) -> QueueConfig {
        QueueConfig::new(dir)
            .with_port(7001)
            .with_busy_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn timeout_then_repeated_failures_end_dead() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, clock) = manual_context();
        let engine = QueueEngine::open(&config_in(dir.path()), ctx).await.unwrap();
        let reclaimer = Reclaimer::new(engine.clone(), ReclaimerConfig::default());

        let request = EnqueueRequest::new("merge_dwgs", json!({ "files": ["a.dwg", "b.dwg"] }))
            .with_idempotency_key("abc")
            .with_priority(10)
            .with_timeout_sec(30)
            .with_max_attempts(3);
        let id = engine.enqueue(request.clone()).await.unwrap();
        assert_eq!(engine.enqueue(request).await.unwrap(), id);

        // Attempt 1: the worker goes silent.
        let claimed = engine.claim().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, id);
        engine.start_running(id).await.unwrap();
        clock.advance(chrono::Duration::seconds(31));
        let report = reclaimer.tick().await.unwrap();
        assert_eq!((report.timed_out, report.requeued), (1, 1));
        let job = engine.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Enqueued);
        assert_eq!(job.attempts, 1);

        // Attempts 2 and 3: business failures.
        for expected_attempts in [2, 3] {
            engine.claim().await.unwrap().unwrap();
            engine.start_running(id).await.unwrap();
            engine.fail(id, "MERGE_FAILED", "xref missing").await.unwrap();
            assert_eq!(engine.get(id).await.unwrap().unwrap().attempts, expected_attempts);
            reclaimer.tick().await.unwrap();
        }

        let job = engine.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error_code.as_deref(), Some("MERGE_FAILED"));

        // Dead jobs never come back.
        reclaimer.tick().await.unwrap();
        assert!(engine.claim().await.unwrap().is_none());

        let metrics = engine.context().metrics.snapshot();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.requeues, 2);
        assert_eq!(metrics.dead_letters, 1);
    }

    #[tokio::test]
    async fn worker_and_reclaimer_retry_a_failed_job() {
        hostq_observability::tracing::init_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let engine = QueueEngine::open(&config_in(dir.path()), QueueContext::new().unwrap())
            .await
            .unwrap();
        let reclaimer = Reclaimer::new(engine.clone(), ReclaimerConfig::default());
        let mut worker = JobWorker::new(engine.clone(), WorkerConfig::default());
        worker.register_fn("sync_model", |job| {
            if job.attempts == 0 {
                Err(CommandError::new("HOST_BUSY", "modal dialog open"))
            } else {
                Ok(json!({ "synced": true }))
            }
        });

        let id = engine
            .enqueue(EnqueueRequest::new("sync_model", json!({})))
            .await
            .unwrap();

        let first = worker.process_next().await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Failed);
        assert_eq!(reclaimer.tick().await.unwrap().requeued, 1);

        let second = worker.process_next().await.unwrap().unwrap();
        assert_eq!(second.state, JobState::Succeeded);

        let job = engine.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result, Some(json!({ "synced": true })));
        assert_eq!(job.error_code, None);
    }

    #[tokio::test]
    async fn restart_recovers_stalled_job_and_keeps_idempotency() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (ctx, clock) = manual_context();

        let id = {
            let engine = QueueEngine::open(&config, ctx.clone()).await.unwrap();
            let id = engine
                .enqueue(
                    EnqueueRequest::new("print_sheets", json!({}))
                        .with_idempotency_key("print-1")
                        .with_timeout_sec(15),
                )
                .await
                .unwrap();
            engine.claim().await.unwrap().unwrap();
            engine.start_running(id).await.unwrap();
            engine.store().close().await;
            id
        };

        // Simulated restart: fresh pool and fresh correlation index.
        let ctx = QueueContext::new().unwrap().with_clock(clock.clone());
        let engine = QueueEngine::open(&config, ctx).await.unwrap();
        assert_eq!(engine.get(id).await.unwrap().unwrap().state, JobState::Running);
        let again = engine
            .enqueue(EnqueueRequest::new("print_sheets", json!({})).with_idempotency_key("print-1"))
            .await
            .unwrap();
        assert_eq!(again, id);

        clock.advance(chrono::Duration::seconds(16));
        Reclaimer::new(engine.clone(), ReclaimerConfig::default())
            .tick()
            .await
            .unwrap();
        let claimed = engine.claim().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, id);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn port_instances_use_separate_databases() {
        hostq_observability::tracing::init_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let a = QueueEngine::open(
            &QueueConfig::new(dir.path()).with_port(7001),
            QueueContext::new().unwrap(),
        )
        .await
        .unwrap();
        let b = QueueEngine::open(
            &QueueConfig::new(dir.path()).with_port(7002),
            QueueContext::new().unwrap(),
        )
        .await
        .unwrap();

        assert_ne!(a.store().path(), b.store().path());
        assert!(a.store().path().ends_with("p7001/jobs.db"));

        let id = a
            .enqueue(EnqueueRequest::new("isolated", json!({})))
            .await
            .unwrap();
        assert!(b.get(id).await.unwrap().is_none());
        assert!(b.claim().await.unwrap().is_none());
        assert_eq!(a.claim().await.unwrap().unwrap().job_id, id);
    }
}
