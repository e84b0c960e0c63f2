//! k-means clustering implementation.
//!
//! Shared by anchor selection (centroids become anchors) and PQ codebook
//! training (one instance per sub-vector segment).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::distance::{l2_squared, row, Metric};
use crate::error::{LeannError, Result};

/// Below this many points assignment stays on the calling thread.
const PARALLEL_THRESHOLD: usize = 1024;

/// k-means clustering over flat row-major vectors.
///
/// Uses k-means++ initialization. `Metric::L2` is the classic squared-L2
/// objective; other metrics assign by that metric and still update centroids
/// as arithmetic means.
pub struct KMeans {
    /// Centroids (k x dimension)
    centroids: Vec<Vec<f32>>,
    dimension: usize,
    k: usize,
    metric: Metric,
    max_iterations: usize,
    tolerance: f32,
    seed: Option<u64>,
}

/// Outcome of [`KMeans::fit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitReport {
    pub iterations: usize,
    pub converged: bool,
    /// Empty clusters re-seeded from far-away points.
    pub reseeded: usize,
    /// The data had fewer distinct points than `k` (or zero variance).
    pub degenerate: bool,
}

impl KMeans {
    /// Create new k-means with k clusters.
    pub fn new(dimension: usize, k: usize) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(LeannError::build("dimension and k must be greater than 0"));
        }

        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            metric: Metric::L2,
            max_iterations: 100,
            tolerance: 1e-6,
            seed: None,
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// When set, repeated `fit(...)` calls on the same inputs produce identical results.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Convergence threshold on the largest centroid shift (L2).
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Train k-means on vectors.
    ///
    /// Uses k-means++ initialization and iterative refinement. `cancel` is
    /// checked once per iteration.
    pub fn fit(
        &mut self,
        vectors: &[f32],
        num_vectors: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<FitReport> {
        if num_vectors == 0 || vectors.len() < num_vectors * self.dimension {
            return Err(LeannError::build("insufficient vectors for k-means"));
        }

        let (init, degenerate) = self.kmeans_plus_plus(vectors, num_vectors);
        self.centroids = init;

        let mut report = FitReport {
            iterations: 0,
            converged: false,
            reseeded: 0,
            degenerate,
        };

        for iteration in 0..self.max_iterations {
            if let Some(token) = cancel {
                token.check()?;
            }
            let assignments = self.assign_clusters(vectors, num_vectors);
            let (new_centroids, reseeded) =
                self.update_centroids(vectors, num_vectors, &assignments);
            report.reseeded += reseeded;

            let shift = self
                .centroids
                .iter()
                .zip(new_centroids.iter())
                .map(|(old, new)| l2_squared(old, new).sqrt())
                .fold(0.0f32, f32::max);

            self.centroids = new_centroids;
            report.iterations = iteration + 1;
            if shift <= self.tolerance && reseeded == 0 {
                report.converged = true;
                break;
            }
        }

        Ok(report)
    }

    /// k-means++ initialization.
    ///
    /// Keeps a running min-distance per point so each new centroid costs one
    /// pass over the data.
    fn kmeans_plus_plus(&self, vectors: &[f32], num_vectors: usize) -> (Vec<Vec<f32>>, bool) {
        // Use an explicit seed when configured; otherwise derive one from entropy.
        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut centroids = Vec::with_capacity(self.k);
        let mut degenerate = false;

        // First centroid: random vector
        let first_idx = rng.random_range(0..num_vectors);
        centroids.push(row(vectors, self.dimension, first_idx).to_vec());

        let mut min_dist: Vec<f32> = (0..num_vectors)
            .map(|i| self.weight(row(vectors, self.dimension, i), &centroids[0]))
            .collect();

        // Subsequent centroids: weighted by distance to nearest existing centroid
        while centroids.len() < self.k {
            let total: f64 = min_dist.iter().map(|&d| d as f64).sum();
            let chosen = if total <= 0.0 {
                degenerate = true;
                rng.random_range(0..num_vectors)
            } else {
                let threshold = rng.random::<f64>() * total;
                let mut cumulative = 0.0;
                let mut pick = num_vectors - 1;
                for (i, &d) in min_dist.iter().enumerate() {
                    cumulative += d as f64;
                    if cumulative >= threshold && d > 0.0 {
                        pick = i;
                        break;
                    }
                }
                pick
            };

            let centroid = row(vectors, self.dimension, chosen).to_vec();
            for (i, slot) in min_dist.iter_mut().enumerate() {
                let d = self.weight(row(vectors, self.dimension, i), &centroid);
                if d < *slot {
                    *slot = d;
                }
            }
            centroids.push(centroid);
        }

        (centroids, degenerate)
    }

    /// Non-negative sampling weight for k-means++.
    #[inline]
    fn weight(&self, a: &[f32], b: &[f32]) -> f32 {
        self.distance(a, b).max(0.0)
    }

    /// Assign vectors to nearest clusters.
    pub fn assign_clusters(&self, vectors: &[f32], num_vectors: usize) -> Vec<usize> {
        let nearest = |i: usize| self.nearest(row(vectors, self.dimension, i)).0;
        if num_vectors >= PARALLEL_THRESHOLD {
            (0..num_vectors).into_par_iter().map(nearest).collect()
        } else {
            (0..num_vectors).map(nearest).collect()
        }
    }

    /// Index of and distance to the closest centroid. Ties go to the lower index.
    pub fn nearest(&self, v: &[f32]) -> (usize, f32) {
        let mut best_cluster = 0;
        let mut best_dist = f32::INFINITY;

        for (cluster_idx, centroid) in self.centroids.iter().enumerate() {
            let dist = self.distance(v, centroid);
            if dist < best_dist {
                best_dist = dist;
                best_cluster = cluster_idx;
            }
        }
        (best_cluster, best_dist)
    }

    /// Update centroids based on assignments.
    ///
    /// Empty clusters are re-seeded from the point farthest from its own
    /// centroid; returns how many were re-seeded.
    fn update_centroids(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        assignments: &[usize],
    ) -> (Vec<Vec<f32>>, usize) {
        let mut cluster_sums = vec![vec![0.0f32; self.dimension]; self.k];
        let mut cluster_counts = vec![0usize; self.k];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            cluster_counts[cluster] += 1;

            let vec = row(vectors, self.dimension, i);
            for (j, &val) in vec.iter().enumerate() {
                cluster_sums[cluster][j] += val;
            }
        }

        let mut new_centroids: Vec<Vec<f32>> = cluster_sums
            .iter()
            .zip(cluster_counts.iter())
            .zip(self.centroids.iter())
            .map(|((sums, &count), old)| {
                if count > 0 {
                    sums.iter().map(|&s| s / count as f32).collect()
                } else {
                    old.clone()
                }
            })
            .collect();

        let empty: Vec<usize> = (0..self.k).filter(|&c| cluster_counts[c] == 0).collect();
        if empty.is_empty() {
            return (new_centroids, 0);
        }

        let mut far: Vec<(f32, usize)> = (0..num_vectors)
            .map(|i| {
                let v = row(vectors, self.dimension, i);
                (self.distance(v, &new_centroids[assignments[i]]), i)
            })
            .collect();
        far.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut reseeded = 0;
        for (cluster, (d, idx)) in empty.into_iter().zip(far.into_iter()) {
            // Zero-distance points add nothing new.
            if d <= 0.0 {
                break;
            }
            new_centroids[cluster] = row(vectors, self.dimension, idx).to_vec();
            reseeded += 1;
        }

        (new_centroids, reseeded)
    }

    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            Metric::L2 => l2_squared(a, b),
            metric => metric.distance(a, b),
        }
    }

    /// Get centroids.
    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    pub fn into_centroids(self) -> Vec<Vec<f32>> {
        self.centroids
    }
}
