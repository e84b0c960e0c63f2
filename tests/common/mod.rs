//! Shared fixtures: seeded corpora, a hashing embedder, a keyword reranker.
#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use leann::config::{AnchorConfig, QuantizerConfig};
use leann::{Embedder, Item, ItemMetadata, LeannConfig, Reranker, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn unit(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// Unit vectors scattered around `clusters` random centers.
pub fn clustered_vectors(n: usize, dim: usize, clusters: usize, spread: f32, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centers: Vec<Vec<f32>> = (0..clusters.max(1))
        .map(|_| unit((0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()))
        .collect();
    (0..n)
        .map(|i| {
            let center = &centers[i % centers.len()];
            unit(
                center
                    .iter()
                    .map(|c| c + spread * (rng.random::<f32>() * 2.0 - 1.0))
                    .collect(),
            )
        })
        .collect()
}

/// Uniformly random unit vectors: nearly orthogonal in high dimension.
pub fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| unit((0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect()))
        .collect()
}

const LANGUAGES: [&str; 3] = ["rust", "python", "go"];

pub fn items_from(vectors: Vec<Vec<f32>>) -> Vec<Item> {
    vectors
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            let language = LANGUAGES[i % LANGUAGES.len()];
            let metadata = ItemMetadata::with_path(format!("src/{language}/file_{i}.txt"))
                .language(language)
                .kind("function");
            Item::new(i as u64, v, metadata)
        })
        .collect()
}

/// Items whose text is `doc <i>`; their vectors come from [`HashEmbedder`].
pub fn text_items(n: usize, dim: usize) -> Vec<Item> {
    let embedder = HashEmbedder::new(dim);
    (0..n)
        .map(|i| {
            let text = format!("doc {i} topic{}", i % 7);
            let embedding = embedder.vector(&text);
            let metadata = ItemMetadata::with_path(format!("docs/{i}.md")).text(text);
            Item::new(i as u64, embedding, metadata)
        })
        .collect()
}

/// Small index settings that build in well under a second.
pub fn small_config(dim: usize) -> LeannConfig {
    let mut config = LeannConfig::with_dimension(dim);
    config.anchors = AnchorConfig {
        count: 16,
        ..AnchorConfig::default()
    };
    config.quantizer = QuantizerConfig {
        sub_vectors: 8,
        codebook_size: 32,
        training_samples: 1024,
        validation_samples: 128,
        ..QuantizerConfig::default()
    };
    config
}

/// Deterministic bag-of-tokens embedder: each token hashes to a bucket.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text.split_whitespace() {
            let mut h = DefaultHasher::new();
            token.hash(&mut h);
            let bits = h.finish();
            let sign = if bits & 1 == 0 { 1.0 } else { -1.0 };
            v[(bits >> 1) as usize % self.dim] += sign;
        }
        v[0] += 1e-3;
        unit(v)
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(batch.iter().map(|t| self.vector(t)).collect())
    }
}

/// Embedder that is always unreachable.
pub struct DownEmbedder {
    pub dim: usize,
}

impl Embedder for DownEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, _batch: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(leann::LeannError::Unavailable("embedding service down".into()))
    }
}

/// Scores by the number of query tokens present in the candidate.
pub struct KeywordReranker;

impl Reranker for KeywordReranker {
    fn score(&self, query: &str, candidate: &str) -> Result<f32> {
        let hits = query
            .split_whitespace()
            .filter(|t| candidate.split_whitespace().any(|c| c == *t))
            .count();
        Ok(hits as f32)
    }
}
