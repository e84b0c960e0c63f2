//! Query latency against candidate anchor count, plus update throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use leann::config::{AnchorConfig, QuantizerConfig};
use leann::{
    IndexBuilder, IndexHandle, Item, ItemMetadata, LeannConfig, NewItem, QueryEngine,
    QueryRequest, UpdateManager,
};
use rand::prelude::*;

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
        .collect()
}

fn handle(n: usize, dim: usize) -> IndexHandle {
    let mut config = LeannConfig::with_dimension(dim);
    config.anchors = AnchorConfig {
        count: 100,
        ..AnchorConfig::default()
    };
    config.quantizer = QuantizerConfig {
        sub_vectors: 16,
        codebook_size: 256,
        retry_larger_codebook: false,
        ..QuantizerConfig::default()
    };
    let items = random_vectors(n, dim, 42)
        .into_iter()
        .enumerate()
        .map(|(i, v)| Item::new(i as u64, v, ItemMetadata::with_path(format!("f{i}"))))
        .collect();
    IndexHandle::new(IndexBuilder::new(&config).build(items).unwrap())
}

fn bench_query_multiplier(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_candidate_multiplier");
    let dim = 128;
    let n_queries = 50;
    let engine = QueryEngine::new(handle(10_000, dim));
    let queries = random_vectors(n_queries, dim, 123);

    for multiplier in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(n_queries as u64));
        group.bench_with_input(
            BenchmarkId::new("multiplier", multiplier),
            multiplier,
            |bench, &multiplier| {
                bench.iter(|| {
                    queries
                        .iter()
                        .map(|q| {
                            engine
                                .search(black_box(
                                    &QueryRequest::vector(q.clone())
                                        .top_k(10)
                                        .candidate_multiplier(multiplier),
                                ))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                });
            },
        );
    }

    group.finish();
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("update");
    let dim = 128;
    let manager = UpdateManager::new(handle(5_000, dim));
    let extra = random_vectors(1_000, dim, 7);
    let mut next_id = 1_000_000u64;

    group.throughput(Throughput::Elements(1));
    group.bench_function("add", |bench| {
        bench.iter(|| {
            let v = extra[(next_id as usize) % extra.len()].clone();
            next_id += 1;
            manager
                .add(NewItem::from_vector(next_id, v, ItemMetadata::default()))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_query_multiplier, bench_add);
criterion_main!(benches);
