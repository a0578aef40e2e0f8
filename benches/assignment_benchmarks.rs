//! Performance Benchmarks for Scenario
//!
//! Covers the request-time and batch hot paths:
//! - Weighted draws over small and large weightings
//! - First-time vs repeat assignment through the manager
//! - Consolidation + analysis throughput

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use scenario::consolidator::consolidate_experiment;
use scenario::experiment::{choose_weighted, ExperimentMetadata};
use scenario::storage::StorageAdapter;
use scenario::{
    ExperimentAnalyzer, Identity, InMemoryStorage, ScenarioConfig, ScenarioManager, Weighting,
};

/// Helper: weighting with `n` treatments of rising weight
fn create_weighting(n: usize) -> Weighting {
    (0..n).fold(Weighting::new(), |w, i| w.with(format!("t{i}"), (i as u32 % 10) + 1))
}

/// Helper: storage holding `count` results for one experiment
fn populate_results(count: usize) -> (InMemoryStorage, scenario::experiment::ExperimentId) {
    let storage = InMemoryStorage::new();
    let exp = storage
        .add_experiment("bench", &ExperimentMetadata::default())
        .expect("add experiment");
    for i in 0..count {
        let id = Identity::new(format!("visitor-{i}")).expect("identity");
        let treatment = if i % 3 == 0 { "alternate" } else { "default" };
        storage.set_treatment(exp.id, treatment, &id).expect("assign");
        if i % 4 == 0 {
            storage.finish_treatment(exp.id, treatment, &id).expect("finish");
        }
    }
    (storage, exp.id)
}

fn bench_weighted_draw(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_draw");

    for size in [2, 10, 100] {
        let weighting = create_weighting(size);
        let mut rng = StdRng::seed_from_u64(7);
        group.bench_with_input(BenchmarkId::from_parameter(size), &weighting, |b, w| {
            b.iter(|| choose_weighted(w, &mut rng).expect("non-empty weighting"));
        });
    }

    group.finish();
}

fn bench_assignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("assignment");

    group.bench_function("first_request", |b| {
        b.iter_batched(
            || {
                let manager = ScenarioManager::with_rng(
                    Arc::new(InMemoryStorage::new()),
                    ScenarioConfig::default(),
                    Box::new(StdRng::seed_from_u64(1)),
                );
                manager.experiment("bench").expect("experiment");
                manager
            },
            |manager| {
                manager
                    .treatment("bench", &Identity::generate(), true)
                    .expect("assignment")
            },
            BatchSize::SmallInput,
        );
    });

    let manager = ScenarioManager::new(Arc::new(InMemoryStorage::new()), ScenarioConfig::default());
    let id = Identity::new("returning-visitor").expect("identity");
    manager.treatment("bench", &id, true).expect("assignment");
    group.bench_function("repeat_request", |b| {
        b.iter(|| manager.treatment("bench", &id, true).expect("assignment"));
    });

    group.finish();
}

fn bench_consolidation(c: &mut Criterion) {
    let mut group = c.benchmark_group("consolidate_and_analyze");
    group.sample_size(20);

    for count in [1_000, 10_000] {
        let (storage, exp) = populate_results(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let (counters, _) =
                    consolidate_experiment(&storage, exp, 1000).expect("consolidate");
                ExperimentAnalyzer::summarize(&counters)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_weighted_draw, bench_assignment, bench_consolidation);
criterion_main!(benches);
