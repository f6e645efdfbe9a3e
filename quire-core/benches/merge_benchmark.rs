use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quire_core::{Anchor, CollaborationEngine, Operation, TextStore};
use uuid::Uuid;

fn seeded_store(len: usize) -> TextStore {
    let mut store = TextStore::new(Uuid::from_u128(1));
    store.apply_local(0, &"x".repeat(len), 0);
    store
}

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Text Operations");
    group.throughput(Throughput::Elements(1));

    group.bench_function("local_insert_middle", |b| {
        // Measures typing into a growing document.
        let mut store = seeded_store(1_000);

        b.iter(|| {
            let index = store.len() / 2;
            let ops = store.apply_local(black_box(index), "a", 0);
            black_box(ops);
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Text Operations");

    let mut source = TextStore::new(Uuid::from_u128(2));
    let ops: Vec<Operation> = (0..500)
        .flat_map(|i| source.apply_local(i, "y", 0))
        .collect();
    group.throughput(Throughput::Elements(ops.len() as u64));

    group.bench_function("apply_remote_500_ops", |b| {
        b.iter(|| {
            let mut dest = TextStore::new(Uuid::from_u128(3));
            for op in ops.iter().cloned() {
                dest.apply_remote(black_box(op));
            }
            black_box(dest.len());
        })
    });

    group.finish();
}

fn bench_anchor_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("Anchors");
    group.throughput(Throughput::Elements(1));

    let mut engine = CollaborationEngine::new(Uuid::from_u128(4));
    engine.apply_local_edit(0, &"z".repeat(2_000), 0);
    let anchor: Anchor = engine.anchor_at(1_500);
    engine.apply_local_edit(1_000, "", 800);

    group.bench_function("resolve_tombstoned_anchor", |b| {
        b.iter(|| {
            black_box(engine.resolve_anchor(black_box(&anchor)).ok());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_local_insert, bench_apply_remote, bench_anchor_resolve);
criterion_main!(benches);
