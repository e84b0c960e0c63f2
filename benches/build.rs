//! Build pipeline benchmarks: anchor selection, graph, PQ training, encoding.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use leann::config::{AnchorConfig, GraphBackend, QuantizerConfig, VamanaParams};
use leann::{IndexBuilder, Item, ItemMetadata, LeannConfig};
use rand::prelude::*;

fn corpus(n: usize, dim: usize, seed: u64) -> Vec<Item> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let v: Vec<f32> = (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect();
            Item::new(i as u64, v, ItemMetadata::with_path(format!("f{i}")))
        })
        .collect()
}

fn config(dim: usize, anchors: usize, graph: GraphBackend) -> LeannConfig {
    let mut config = LeannConfig::with_dimension(dim);
    config.anchors = AnchorConfig {
        count: anchors,
        ..AnchorConfig::default()
    };
    config.quantizer = QuantizerConfig {
        sub_vectors: 16,
        codebook_size: 256,
        retry_larger_codebook: false,
        ..QuantizerConfig::default()
    };
    config.graph = graph;
    config
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(10);

    let dim = 128;
    for n in [2_000, 10_000].iter() {
        let items = corpus(*n, dim, 42);
        group.throughput(Throughput::Elements(*n as u64));

        let hnsw = config(dim, 100, GraphBackend::default());
        group.bench_with_input(BenchmarkId::new("hnsw", n), n, |bench, _| {
            bench.iter(|| IndexBuilder::new(&hnsw).build(black_box(items.clone())).unwrap());
        });

        let vamana = config(dim, 100, GraphBackend::Vamana(VamanaParams::default()));
        group.bench_with_input(BenchmarkId::new("vamana", n), n, |bench, _| {
            bench.iter(|| IndexBuilder::new(&vamana).build(black_box(items.clone())).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build);
criterion_main!(benches);
