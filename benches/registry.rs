//! Catalog scan and rerank scoring benchmarks
//!
//! Benchmarks for:
//! - Scanning a models directory of increasing size
//! - Catalog lookups by name
//! - Scoring and sorting documents for a rerank request

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use llama_embed_manager::models::{ModelRegistry, ScanSettings};
use llama_embed_manager::rerank::rank;
use std::hint::black_box;
use tempfile::TempDir;

/// Models directory with `count` embedding and `count` reranker artifacts
fn populated_models_dir(count: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    for sub in ["embeddings", "rerankers"] {
        let path = dir.path().join(sub);
        std::fs::create_dir_all(&path).unwrap();
        for i in 0..count {
            std::fs::write(path.join(format!("model-{:04}.gguf", i)), b"GGUF").unwrap();
        }
    }
    dir
}

/// Deterministic pseudo-random vector
fn vector(seed: usize, dims: usize) -> Vec<f32> {
    (0..dims)
        .map(|i| (((seed * 31 + i * 17) % 97) as f32 / 97.0) - 0.5)
        .collect()
}

fn bench_catalog_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("catalog_scan");

    for count in [10, 100, 500] {
        let dir = populated_models_dir(count);
        let settings = ScanSettings::default();

        group.bench_with_input(BenchmarkId::new("models", count * 2), &dir, |b, dir| {
            b.iter(|| {
                let registry = ModelRegistry::scan(dir.path(), &settings).unwrap();
                black_box(registry.len())
            });
        });
    }
    group.finish();
}

fn bench_catalog_lookup(c: &mut Criterion) {
    let dir = populated_models_dir(500);
    let registry = ModelRegistry::scan(dir.path(), &ScanSettings::default()).unwrap();

    c.bench_function("catalog_lookup", |b| {
        b.iter(|| black_box(registry.get(black_box("reranker_model-0250"))))
    });
}

fn bench_rerank(c: &mut Criterion) {
    let mut group = c.benchmark_group("rerank");
    let dims = 768;
    let query = vector(0, dims);

    for doc_count in [10, 100, 1000] {
        let documents: Vec<String> = (0..doc_count).map(|i| format!("document {}", i)).collect();
        let embeddings: Vec<Vec<f32>> = (1..=doc_count).map(|i| vector(i, dims)).collect();

        group.bench_with_input(
            BenchmarkId::new("documents", doc_count),
            &(documents, embeddings),
            |b, (documents, embeddings)| {
                b.iter(|| black_box(rank(&query, documents, embeddings, Some(10))));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_catalog_scan, bench_catalog_lookup, bench_rerank);
criterion_main!(benches);
