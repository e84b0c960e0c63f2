//! Anchor selection: choose M anchors from N embeddings and assign every item.
//!
//! Strategies are a tagged enum ([`AnchorStrategy`]) picked from config.
//! Whatever the strategy, the final assignment is a brute-force nearest-anchor
//! pass under the index metric, so every item belongs to exactly one anchor
//! and it is the anchor a graph search for that item's vector converges to.
//!
//! Degenerate input (fewer items than anchors, zero variance, non-finite
//! centroids) falls back to random selection and records why in
//! [`AnchorSelection::degraded`]. Only an empty corpus is an error.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::kmeans::KMeans;
use crate::cancel::CancelToken;
use crate::config::{AnchorConfig, AnchorStrategy, GroupKey, Quota};
use crate::distance::{row, Metric};
use crate::error::{LeannError, Result};
use crate::types::{AnchorId, ItemMetadata};

/// Result of anchor selection.
#[derive(Debug, Clone)]
pub struct AnchorSelection {
    /// Anchor vectors; index is the [`AnchorId`].
    pub anchors: Vec<Vec<f32>>,
    /// Owning anchor per input item, same order as the input.
    pub assignments: Vec<AnchorId>,
    /// Set when a fallback was taken.
    pub degraded: Option<String>,
}

impl AnchorSelection {
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Member count per anchor.
    pub fn member_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.anchors.len()];
        for &a in &self.assignments {
            counts[a as usize] += 1;
        }
        counts
    }
}

/// Selects anchors for one build.
pub struct AnchorSelector<'a> {
    config: &'a AnchorConfig,
    metric: Metric,
    dimension: usize,
    seed: u64,
    cancel: Option<&'a CancelToken>,
}

impl<'a> AnchorSelector<'a> {
    pub fn new(config: &'a AnchorConfig, metric: Metric, dimension: usize, seed: u64) -> Self {
        Self {
            config,
            metric,
            dimension,
            seed,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Select anchors over `vectors` (row-major, `metadata.len()` rows).
    pub fn select(&self, vectors: &[f32], metadata: &[ItemMetadata]) -> Result<AnchorSelection> {
        let n = metadata.len();
        if n == 0 {
            return Err(LeannError::build("cannot select anchors from an empty corpus"));
        }
        if vectors.len() != n * self.dimension {
            return Err(LeannError::DimensionMismatch {
                expected: n * self.dimension,
                actual: vectors.len(),
            });
        }

        let target = self.config.count;
        let mut degraded = None;

        let anchors = if n < target {
            let reason = format!("corpus has {n} items, fewer than {target} anchors");
            warn!(n, target, "anchor selection falling back to random: {reason}");
            degraded = Some(reason);
            self.random(vectors, n, n)
        } else {
            match &self.config.strategy {
                AnchorStrategy::Random => self.random(vectors, n, target),
                AnchorStrategy::KMeans => {
                    match self.kmeans(vectors, n, target, self.seed)? {
                        Ok(anchors) => anchors,
                        Err(reason) => {
                            warn!(n, target, "k-means failed, falling back to random: {reason}");
                            degraded = Some(reason);
                            self.random(vectors, n, target)
                        }
                    }
                }
                AnchorStrategy::StratifiedKMeans {
                    group_by,
                    quota,
                    min_per_group,
                } => {
                    let (anchors, reason) = self.stratified(
                        vectors,
                        metadata,
                        target,
                        *group_by,
                        *quota,
                        *min_per_group,
                    )?;
                    degraded = reason;
                    anchors
                }
                AnchorStrategy::MaxCoverage {
                    diversity_threshold,
                } => self.max_coverage(vectors, n, target, *diversity_threshold)?,
            }
        };

        if let Some(token) = self.cancel {
            token.check()?;
        }
        let assignments = assign_all(&anchors, vectors, self.dimension, self.metric);
        info!(
            items = n,
            anchors = anchors.len(),
            degraded = degraded.is_some(),
            "anchor selection complete"
        );

        Ok(AnchorSelection {
            anchors,
            assignments,
            degraded,
        })
    }

    fn random(&self, vectors: &[f32], n: usize, m: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut picked = rand::seq::index::sample(&mut rng, n, m.min(n)).into_vec();
        picked.sort_unstable();
        picked
            .into_iter()
            .map(|i| row(vectors, self.dimension, i).to_vec())
            .collect()
    }

    /// k-means over a bounded sample. The inner `Err` is a degraded reason.
    fn kmeans(
        &self,
        vectors: &[f32],
        n: usize,
        k: usize,
        seed: u64,
    ) -> Result<std::result::Result<Vec<Vec<f32>>, String>> {
        let sample_n = self.config.samples.max(k).min(n);
        let sample: Vec<f32> = if sample_n == n {
            vectors.to_vec()
        } else {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut idx = rand::seq::index::sample(&mut rng, n, sample_n).into_vec();
            idx.sort_unstable();
            idx.iter()
                .flat_map(|&i| row(vectors, self.dimension, i).iter().copied())
                .collect()
        };

        let mut km = KMeans::new(self.dimension, k)?
            .with_seed(seed)
            .with_metric(clustering_metric(self.metric))
            .with_max_iterations(self.config.max_iterations)
            .with_tolerance(self.config.tolerance);
        let report = km.fit(&sample, sample_n, self.cancel)?;
        debug!(
            iterations = report.iterations,
            converged = report.converged,
            reseeded = report.reseeded,
            "anchor k-means finished"
        );

        if report.degenerate {
            return Ok(Err(format!(
                "k-means input has fewer than {k} distinct points"
            )));
        }
        let centroids = km.into_centroids();
        if centroids.iter().flatten().any(|x| !x.is_finite()) {
            return Ok(Err("k-means produced non-finite centroids".to_string()));
        }
        Ok(Ok(centroids))
    }

    fn stratified(
        &self,
        vectors: &[f32],
        metadata: &[ItemMetadata],
        target: usize,
        group_by: GroupKey,
        quota: Quota,
        min_per_group: usize,
    ) -> Result<(Vec<Vec<f32>>, Option<String>)> {
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, meta) in metadata.iter().enumerate() {
            let key = match group_by {
                GroupKey::Language => meta.language.as_deref(),
                GroupKey::Kind => meta.kind.as_deref(),
            };
            groups.entry(key.unwrap_or("unknown")).or_default().push(i);
        }

        let sizes: Vec<usize> = groups.values().map(Vec::len).collect();
        let quotas = allocate_quotas(&sizes, target, quota, min_per_group);

        let mut anchors = Vec::with_capacity(target);
        let mut degraded = Vec::new();
        for (g, ((key, members), &k)) in groups.iter().zip(quotas.iter()).enumerate() {
            if k == 0 {
                continue;
            }
            let group_vectors: Vec<f32> = members
                .iter()
                .flat_map(|&i| row(vectors, self.dimension, i).iter().copied())
                .collect();
            let group_seed = self.seed.wrapping_add(g as u64);
            match self.kmeans(&group_vectors, members.len(), k, group_seed)? {
                Ok(centroids) => anchors.extend(centroids),
                Err(reason) => {
                    warn!(group = %key, "group k-means failed, using random anchors: {reason}");
                    degraded.push(format!("group {key}: {reason}"));
                    let sub = AnchorSelector {
                        seed: group_seed,
                        ..*self
                    };
                    anchors.extend(sub.random(&group_vectors, members.len(), k));
                }
            }
            debug!(group = %key, members = members.len(), anchors = k, "stratum selected");
        }

        let reason = (!degraded.is_empty()).then(|| degraded.join("; "));
        Ok((anchors, reason))
    }

    fn max_coverage(
        &self,
        vectors: &[f32],
        n: usize,
        target: usize,
        threshold: f32,
    ) -> Result<Vec<Vec<f32>>> {
        use rand::Rng;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let start = rng.random_range(0..n);
        let mut selected = vec![start];
        let mut min_dist: Vec<f32> = (0..n)
            .into_par_iter()
            .map(|i| {
                self.metric
                    .distance(row(vectors, self.dimension, i), row(vectors, self.dimension, start))
            })
            .collect();
        min_dist[start] = f32::NEG_INFINITY;

        while selected.len() < target {
            if let Some(token) = self.cancel {
                token.check()?;
            }
            let (best, best_dist) = min_dist
                .iter()
                .enumerate()
                .fold((usize::MAX, f32::NEG_INFINITY), |acc, (i, &d)| {
                    if d > acc.1 {
                        (i, d)
                    } else {
                        acc
                    }
                });
            if best == usize::MAX || best_dist <= threshold {
                debug!(
                    selected = selected.len(),
                    best_dist, "max-coverage stopped at diversity threshold"
                );
                break;
            }
            selected.push(best);
            let chosen = row(vectors, self.dimension, best);
            min_dist.par_iter_mut().enumerate().for_each(|(i, slot)| {
                if *slot == f32::NEG_INFINITY {
                    return;
                }
                let d = self.metric.distance(row(vectors, self.dimension, i), chosen);
                if d < *slot {
                    *slot = d;
                }
            });
            min_dist[best] = f32::NEG_INFINITY;
        }

        Ok(selected
            .into_iter()
            .map(|i| row(vectors, self.dimension, i).to_vec())
            .collect())
    }
}

/// Metric used *inside* k-means. Inner-product assignment rewards large
/// norms, so it clusters with L2.
fn clustering_metric(metric: Metric) -> Metric {
    match metric {
        Metric::InnerProduct => Metric::L2,
        m => m,
    }
}

/// Nearest anchor by `metric`. Ties go to the lower anchor id.
pub fn nearest_anchor(anchors: &[Vec<f32>], v: &[f32], metric: Metric) -> (AnchorId, f32) {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, a) in anchors.iter().enumerate() {
        let d = metric.distance(v, a);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    (best as AnchorId, best_dist)
}

/// Assign every row of `vectors` to its nearest anchor, in parallel.
pub fn assign_all(
    anchors: &[Vec<f32>],
    vectors: &[f32],
    dimension: usize,
    metric: Metric,
) -> Vec<AnchorId> {
    vectors
        .par_chunks(dimension)
        .map(|v| nearest_anchor(anchors, v, metric).0)
        .collect()
}

/// Split `target` anchors across groups of the given sizes.
///
/// Each group gets `floor(raw)` (raw = proportional share or `target / G`),
/// raised to `min_per_group` and capped at its size. The total is then
/// reconciled to `min(target, sum(sizes))` by largest remainder.
pub fn allocate_quotas(
    sizes: &[usize],
    target: usize,
    quota: Quota,
    min_per_group: usize,
) -> Vec<usize> {
    let groups = sizes.len();
    if groups == 0 {
        return Vec::new();
    }
    let total_items: usize = sizes.iter().sum();
    let target = target.min(total_items);

    let raw: Vec<f64> = sizes
        .iter()
        .map(|&s| match quota {
            Quota::Proportional => target as f64 * s as f64 / total_items.max(1) as f64,
            Quota::Uniform => target as f64 / groups as f64,
        })
        .collect();
    let floor_of = |g: usize| min_per_group.min(sizes[g]);
    let mut alloc: Vec<usize> = (0..groups)
        .map(|g| (raw[g].floor() as usize).max(floor_of(g)).min(sizes[g]))
        .collect();

    // Largest remainder first; ties to the earlier group.
    let mut order: Vec<usize> = (0..groups).collect();
    order.sort_by(|&a, &b| {
        let ra = raw[a] - raw[a].floor();
        let rb = raw[b] - raw[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });

    let mut assigned: usize = alloc.iter().sum();
    while assigned < target {
        let mut progressed = false;
        for &g in &order {
            if assigned == target {
                break;
            }
            if alloc[g] < sizes[g] {
                alloc[g] += 1;
                assigned += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    // Over-allocated by minimums: shave the largest groups, first down to the
    // minimum, then to one anchor, then to none.
    for pass in 0..3 {
        let limit = |g: usize| match pass {
            0 => floor_of(g),
            1 => sizes[g].min(1),
            _ => 0,
        };
        while assigned > target {
            let victim = (0..groups)
                .filter(|&g| alloc[g] > limit(g))
                .max_by(|&a, &b| alloc[a].cmp(&alloc[b]).then(b.cmp(&a)));
            match victim {
                Some(g) => {
                    alloc[g] -= 1;
                    assigned -= 1;
                }
                None => break,
            }
        }
    }
    alloc
}
