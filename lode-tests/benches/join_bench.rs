/// Performance benchmarks for Lode cursors and join solvers
///
/// Run with: cargo bench -p lode-tests

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lode_api::{LodeKey, NestedLoop, Query, SortedMerge, ZigzagMerge};
use lode_test_utils::{fixture_schema, Backend, MockDataGenerator, TestDatabase};

fn herd(backend: Backend, size: usize) -> TestDatabase {
    let t = TestDatabase::new(backend, &fixture_schema());
    let mut generator = MockDataGenerator::new();
    t.db.put_all("animals", generator.animals(size)).unwrap();
    t
}

fn bench_put_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_batch");

    for backend in Backend::ALL {
        for batch_size in [100, 1000] {
            group.throughput(Throughput::Elements(batch_size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", backend), batch_size),
                &batch_size,
                |b, &batch_size| {
                    b.iter(|| {
                        let t = TestDatabase::new(backend, &fixture_schema());
                        let mut generator = MockDataGenerator::new();
                        t.db.put_all("animals", black_box(generator.animals(batch_size)))
                            .unwrap();
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_index_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_walk");

    for backend in Backend::ALL {
        for size in [1000, 10_000] {
            let t = herd(backend, size);
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(BenchmarkId::new(format!("{:?}", backend), size), &size, |b, _| {
                b.iter(|| {
                    let keys = t.db.primary_keys(&Query::index("animals", "legs"), None).unwrap();
                    black_box(keys);
                });
            });
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}/unique", backend), size),
                &size,
                |b, _| {
                    b.iter(|| {
                        let query = Query::index("animals", "color").unique();
                        black_box(t.db.keys(&query, None).unwrap());
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_solvers(c: &mut Criterion) {
    let mut group = c.benchmark_group("solvers");
    let scalar = [
        Query::index("animals", "color").only("spots").unwrap(),
        Query::index("animals", "legs").only(2).unwrap(),
    ];
    let prefixes = [
        Query::index("animals", "horn_name")
            .starts(LodeKey::array([LodeKey::from(2)]))
            .unwrap(),
        Query::index("animals", "legs_name")
            .starts(LodeKey::array([LodeKey::from(2)]))
            .unwrap(),
    ];

    for backend in Backend::ALL {
        let t = herd(backend, 2000);
        let id = |solver: &str| BenchmarkId::new(solver, format!("{:?}", backend));

        group.bench_function(id("sorted_merge"), |b| {
            b.iter(|| {
                let mut solver = SortedMerge::new(Vec::new());
                t.db.scan(&mut solver, black_box(&scalar)).unwrap();
                solver.into_output()
            });
        });
        group.bench_function(id("zigzag_merge"), |b| {
            b.iter(|| {
                let mut solver = ZigzagMerge::new(Vec::new());
                t.db.scan(&mut solver, black_box(&prefixes)).unwrap();
                solver.into_output()
            });
        });
        group.sample_size(10);
        group.bench_function(id("nested_loop"), |b| {
            b.iter(|| {
                let mut solver = NestedLoop::new(Vec::new());
                t.db.scan(&mut solver, black_box(&scalar)).unwrap();
                solver.into_output()
            });
        });
        group.sample_size(100);
    }
    group.finish();
}

criterion_group!(benches, bench_put_batch, bench_index_walk, bench_solvers);
criterion_main!(benches);
