//! Benchmarks for eviction scoring and deletion planning.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use archive_cache::cache::object::{now_millis, CachedObject};
use archive_cache::cache::strategy::{BigOldStrategy, SelectionStrategy};
use archive_cache::cache::DeletionPlanner;
use archive_cache::inventory::Catalog;
use archive_cache::volume::MemoryVolume;

fn bench_big_old_scoring(c: &mut Criterion) {
    let strategy = BigOldStrategy::new(u64::MAX);
    let now = now_millis();

    // 10,000 objects of varying age and size.
    let objects: Vec<CachedObject> = (0..10_000u64)
        .map(|i| {
            let mut obj = CachedObject::new("bench", format!("obj-{i}"));
            obj.size = Some(1024 * (1 + i % 997));
            obj.since = now - (i as i64) * 60_000;
            obj
        })
        .collect();

    c.bench_function("big_old_score_10k", |b| {
        b.iter(|| {
            let mut scorer = strategy.for_size(u64::MAX);
            let mut objs = objects.clone();
            for obj in objs.iter_mut() {
                black_box(scorer.score(obj));
            }
            black_box(scorer.total_size());
        })
    });
}

fn bench_plan_selection(c: &mut Criterion) {
    let catalog = Arc::new(Catalog::in_memory().expect("catalog"));
    catalog
        .register_volume("bench", 10_000_000, None)
        .expect("register volume");
    for i in 0..2_000u64 {
        let md = json!({ "size": 4096 + i, "since": now_millis() - (i as i64) * 1000 });
        catalog
            .add_object(
                &format!("ds/obj-{i}"),
                "bench",
                &format!("obj-{i}"),
                md.as_object(),
            )
            .expect("add object");
    }
    let volume = Arc::new(MemoryVolume::new("bench"));
    let planner = DeletionPlanner::new(catalog.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));

    c.bench_function("plan_4mb_from_2k", |b| {
        b.iter(|| {
            let plan = planner
                .plan(volume.clone(), black_box(4_000_000), None)
                .expect("plan");
            black_box(plan.planned_bytes());
        })
    });
}

criterion_group!(benches, bench_big_old_scoring, bench_plan_selection);
criterion_main!(benches);
