use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

use hostq_core::EnqueueRequest;
use hostq_infra::{JobStore, QueueContext, QueueEngine, WorkerBinding};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn setup(rt: &Runtime, dir: &tempfile::TempDir, binding: WorkerBinding) -> QueueEngine {
    rt.block_on(async {
        let store = JobStore::open_path(&dir.path().join("jobs.db"), Duration::from_secs(5), 4)
            .await
            .unwrap();
        QueueEngine::new(store, binding, QueueContext::new().unwrap())
    })
}

fn request(i: u64) -> EnqueueRequest {
    EnqueueRequest::new("bench_command", json!({ "seq": i })).with_priority((i % 10) as i32)
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let engine = setup(&rt, &dir, WorkerBinding::unbound());

    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    let mut seq = 0u64;
    group.bench_function("fresh_job", |b| {
        b.to_async(&rt).iter(|| {
            seq += 1;
            let engine = engine.clone();
            let req = request(seq);
            async move { black_box(engine.enqueue(req).await.unwrap()) }
        });
    });

    rt.block_on(engine.enqueue(request(0).with_idempotency_key("hot-key")))
        .unwrap();
    group.bench_function("idempotent_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                engine
                    .enqueue(request(0).with_idempotency_key("hot-key"))
                    .await
                    .unwrap(),
            )
        });
    });

    group.finish();
}

fn bench_claim_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_cycle");

    for (label, binding) in [
        ("unbound", WorkerBinding::unbound()),
        ("port", WorkerBinding::port(7001)),
        ("strict", WorkerBinding::strict(7001)),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let engine = setup(&rt, &dir, binding);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(label), &engine, |b, engine| {
            b.to_async(&rt).iter(|| async {
                let id = engine.enqueue(request(1)).await.unwrap();
                let job = engine.claim().await.unwrap().unwrap();
                engine.start_running(job.job_id).await.unwrap();
                engine.complete(id, &json!({ "ok": true })).await.unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_cycle);
criterion_main!(benches);
