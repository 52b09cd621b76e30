//! kNN hot-path baseline: flat scan vs HNSW at small corpus sizes.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use engram_types::{EngramConfig, Metadata, VectorId};
use engram_vector::SearchOptions;

const DIM: usize = 64;
const CORPUS: usize = 2_000;

fn seeded_vector(seed: usize) -> Vec<f32> {
    let raw: Vec<f32> = (0..DIM)
        .map(|j| (((seed * 31 + j * 7) % 97) as f32 / 97.0) - 0.5)
        .collect();
    engram_vector::l2_normalize(&raw).expect("non-zero")
}

fn build(hnsw: bool) -> engram::Engram {
    let mut config = EngramConfig::default();
    config.dim = DIM;
    config.hnsw.enabled = hnsw;
    let engram = engram::Engram::in_memory(config).expect("assemble");
    for i in 0..CORPUS {
        engram
            .store
            .insert(
                VectorId::from(format!("v{i}")),
                seeded_vector(i),
                Metadata::new(),
            )
            .expect("insert");
    }
    engram
}

fn bench_knn(c: &mut Criterion) {
    let flat = build(false);
    let indexed = build(true);
    let query = seeded_vector(CORPUS / 2);

    let mut group = c.benchmark_group("knn_top10");
    group.bench_function("flat_scan", |b| {
        b.iter(|| {
            let hits = flat
                .store
                .search(black_box(&query), 10, &SearchOptions::default())
                .expect("search");
            black_box(hits)
        });
    });
    group.bench_function("hnsw", |b| {
        b.iter(|| {
            let hits = indexed
                .store
                .search(black_box(&query), 10, &SearchOptions::default())
                .expect("search");
            black_box(hits)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_knn);
criterion_main!(benches);
