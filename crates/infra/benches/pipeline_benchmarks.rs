use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::{Duration, Utc};
use insightforge_events::NewBehaviorEvent;
use insightforge_infra::batches::{Insight, SealPolicy};
use insightforge_infra::jobs::{AnalysisJob, RetryPolicy, TriggerType};
use insightforge_infra::metrics::LatencySummary;
use insightforge_infra::store::{BatchStore, InMemoryPipelineStore, JobStore};
use insightforge_ai::AnalysisOutput;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_event_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append");
    group.throughput(Throughput::Elements(1));

    group.bench_function("append_to_open_batch", |b| {
        let rt = runtime();
        let store = InMemoryPipelineStore::new();
        b.iter(|| {
            let now = Utc::now();
            rt.block_on(store.append_event(
                NewBehaviorEvent::new("view", black_box("user-1"), now),
                now,
            ))
            .unwrap();
        });
    });

    group.finish();
}

/// Insert, claim and complete one job per iteration, at different queue depths.
fn bench_claim_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_complete");
    group.throughput(Throughput::Elements(1));

    for depth in [1usize, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("queue_depth", depth), depth, |b, &depth| {
            let rt = runtime();
            let store = InMemoryPipelineStore::new();
            let now = Utc::now();

            // Sealed batch used for every completion.
            let event = rt
                .block_on(store.append_event(NewBehaviorEvent::new("view", "u", now), now))
                .unwrap();
            rt.block_on(store.seal_batch(&event.batch_id, now)).unwrap();
            let batch = rt.block_on(store.get_batch(&event.batch_id)).unwrap().unwrap();

            // Backlog of jobs that are not yet claimable.
            for i in 0..depth {
                let mut job = AnalysisJob::new(
                    format!("backlog_{i}").parse().unwrap(),
                    5,
                    TriggerType::Scheduled,
                    now,
                );
                job.lock_expires_at = Some(now + Duration::days(1));
                rt.block_on(store.insert_job(&job)).unwrap();
            }

            b.iter(|| {
                let job = AnalysisJob::new(batch.id.clone(), 5, TriggerType::Scheduled, now);
                let id = job.id;
                store.put_job(job).unwrap();

                let claimed = rt
                    .block_on(store.try_claim(id, now, now + Duration::minutes(10)))
                    .unwrap()
                    .unwrap();
                let insight =
                    Insight::from_output(&batch, AnalysisOutput::new("bench", 0.5), 1, now);
                black_box(
                    rt.block_on(store.complete_job(&claimed.lease().unwrap(), &insight, 1, now))
                        .unwrap(),
                );
            });
        });
    }

    group.finish();
}

fn bench_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("policies");

    let retry = RetryPolicy::default();
    group.bench_function("backoff_delay", |b| {
        b.iter(|| retry.delay_for_attempt(black_box(3)));
    });

    let samples: Vec<u64> = (0..10_000).map(|i| (i * 7919) % 120_000).collect();
    group.bench_function("latency_summary_10k", |b| {
        b.iter(|| LatencySummary::from_samples(3600, black_box(samples.clone())));
    });

    let policy = SealPolicy::default();
    group.bench_function("seal_age_cutoff", |b| {
        b.iter(|| policy.age_cutoff(black_box(Utc::now())));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_event_append,
    bench_claim_complete,
    bench_policies
);
criterion_main!(benches);
