//! Performance benchmarks for harbor-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use harbor_engine::{
    execute, Comparison, IndexDef, Item, MemoryStore, QuerySpec, SortDirection, PRIMARY_KEY_PATH,
};
use serde_json::json;

fn populated_store(n: usize) -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .ensure(
            "users",
            PRIMARY_KEY_PATH,
            &[IndexDef::new("city"), IndexDef::unique("email")],
        )
        .unwrap();
    for i in 0..n {
        let data = json!({
            "name": format!("User {i}"),
            "email": format!("user{i}@example.com"),
            "city": format!("city-{}", i % 50),
            "age": i % 90,
        });
        store
            .put(Item::new(format!("user_{i}"), "users", data, "bench", 1000))
            .unwrap();
    }
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    group.bench_function("put", |b| {
        let mut store = populated_store(0);
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            let item = Item::new(
                format!("user_{id}"),
                "users",
                json!({"email": format!("{id}@x"), "city": "Oslo"}),
                "bench",
                1000,
            );
            store.put(black_box(item))
        })
    });

    group.bench_function("get", |b| {
        let store = populated_store(1000);
        b.iter(|| store.get(black_box("users"), black_box("user_500")))
    });

    group.bench_function("ensure_backfill_1000", |b| {
        b.iter_batched(
            || populated_store(1000),
            |mut store| store.ensure("users", PRIMARY_KEY_PATH, &[IndexDef::new("age")]),
            criterion::BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    for size in [100, 1000, 10000].iter() {
        let store = populated_store(*size);
        let spec = QuerySpec::new("users")
            .filter("city", Comparison::Equals(json!("city-7")))
            .sort_by("age", SortDirection::Desc)
            .take(10);

        group.bench_with_input(BenchmarkId::new("index_lookup", size), size, |b, _| {
            b.iter(|| {
                let candidates = store
                    .get_all_by_index("users", "city", &json!("city-7"))
                    .unwrap();
                execute(candidates, black_box(&spec))
            })
        });

        group.bench_with_input(BenchmarkId::new("full_scan", size), size, |b, _| {
            b.iter(|| {
                let candidates = store.get_all("users").unwrap();
                execute(candidates, black_box(&spec))
            })
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 1000].iter() {
        let store = populated_store(*size);
        let json = store.export_state().to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("export", size), size, |b, _| {
            b.iter(|| store.export_state().to_json())
        });

        group.bench_with_input(BenchmarkId::new("import", size), size, |b, _| {
            b.iter(|| {
                let snapshot = harbor_engine::StoreSnapshot::from_json(black_box(&json)).unwrap();
                MemoryStore::import_state(snapshot)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_store_operations, bench_query, bench_snapshot);
criterion_main!(benches);
