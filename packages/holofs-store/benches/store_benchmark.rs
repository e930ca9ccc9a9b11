//! Benchmark for artifact store writes and reads
//!
//! Measures:
//! - put throughput for fresh content
//! - get of the current version under a populated store

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use holofs_store::{ArtifactStore, InMemoryArtifactStore};

fn transcript(lines: usize, salt: usize) -> String {
    (0..lines)
        .map(|i| format!("Speaker{}: line {} of take {}\n", i % 3, i, salt))
        .collect()
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_put");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for lines in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, &lines| {
            let store = InMemoryArtifactStore::default();
            let mut salt = 0;
            b.iter(|| {
                salt += 1;
                let body = transcript(lines, salt);
                rt.block_on(async {
                    let v = store.put("/bench/put.txt", body.as_bytes()).await.unwrap();
                    black_box(v);
                });
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_get");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for artifacts in [10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(artifacts),
            artifacts,
            |b, &artifacts| {
                let store = InMemoryArtifactStore::default();
                rt.block_on(async {
                    for i in 0..artifacts {
                        let path = format!("/bench/{}.txt", i);
                        store.put(&path, transcript(20, i).as_bytes()).await.unwrap();
                    }
                });
                b.iter(|| {
                    rt.block_on(async {
                        let content = store.get("/bench/0.txt", None).await.unwrap();
                        black_box(content);
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
