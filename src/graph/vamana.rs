//! Vamana graph construction algorithm with alpha-pruning.
//!
//! Vamana (from DiskANN) builds high-quality navigable graphs using:
//! - Greedy search for candidate neighbors
//! - Alpha-pruning for diversity (avoids redundant edges)
//! - Multiple refinement passes
//! - Symmetrization (bidirectional edges)
//!
//! # Key Parameters
//!
//! - `max_degree` (R): Maximum neighbors per node
//! - `alpha`: Pruning slack (1.0 = strict, >1 keeps longer "highway" edges)
//! - `build_beam_width` (L): Search width during construction
//!
//! # Algorithm
//!
//! Starting from a random R/2-regular graph, for each pass and each node v
//! (in a seeded shuffled order):
//! 1. Find candidates via greedy search from the medoid plus random seeds
//! 2. Alpha-prune candidates to get diverse neighbors
//!
//! then symmetrize. The first pass prunes with alpha = 1 (tight local edges);
//! later passes use the configured alpha to keep long "highway" edges.
//!
//! # References
//!
//! - Subramanya et al. (2019): "DiskANN: Fast Accurate Billion-point Nearest
//!   Neighbor Search on a Single Node"

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::check_neighbor_ids;
use super::search::beam_search;
use crate::cancel::CancelToken;
use crate::config::VamanaParams;
use crate::distance::Metric;
use crate::error::{LeannError, Result};
use crate::persistence::{PersistenceError, PersistenceResult};

/// Single-layer degree-bounded graph over anchor ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VamanaGraph {
    /// Adjacency lists (node -> neighbors)
    pub adjacency: Vec<Vec<u32>>,
    /// Medoid (entry point) ID
    pub medoid: u32,
    pub max_degree: usize,
    pub metric: Metric,
}

impl VamanaGraph {
    /// Build over `vectors`. Node `i` is anchor `i`.
    pub fn build(
        vectors: &[Vec<f32>],
        params: &VamanaParams,
        metric: Metric,
        seed: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<Self> {
        let n = vectors.len();
        if n == 0 {
            return Err(LeannError::build("cannot build Vamana over zero anchors"));
        }
        let dist = |a: u32, b: u32| metric.distance(&vectors[a as usize], &vectors[b as usize]);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut graph = initialize_random_graph(n, params.max_degree, &mut rng);
        let medoid = find_medoid(vectors, metric);

        for pass in 0..params.passes {
            if let Some(token) = cancel {
                token.check()?;
            }
            let alpha = if pass == 0 { 1.0 } else { params.alpha };

            let mut order: Vec<u32> = (0..n as u32).collect();
            order.shuffle(&mut rng);

            for (step, &node) in order.iter().enumerate() {
                if step % 256 == 255 {
                    if let Some(token) = cancel {
                        token.check()?;
                    }
                }
                let seeds = pick_seeds(medoid, n, params.extra_seeds, &mut rng);
                let candidates =
                    gather_candidates(node, &graph, &seeds, params.build_beam_width, &dist)?;
                graph[node as usize] = alpha_prune(node, &candidates, params.max_degree, alpha, &dist);
            }

            symmetrize_graph(&mut graph, params.max_degree, &dist, alpha);
            debug!(pass, alpha, "Vamana refinement pass complete");
        }

        Ok(Self {
            adjacency: graph,
            medoid,
            max_degree: params.max_degree,
            metric,
        })
    }

    /// k nearest anchors to `query`.
    pub fn search(
        &self,
        vectors: &[Vec<f32>],
        query: &[f32],
        k: usize,
        beam_width: usize,
    ) -> Result<Vec<(u32, f32)>> {
        let mut out = beam_search(
            &[self.medoid],
            beam_width.max(k),
            |n, buf| {
                buf.extend_from_slice(&self.adjacency[n as usize]);
                Ok(())
            },
            |id| self.metric.distance(query, &vectors[id as usize]),
        )?;
        out.truncate(k);
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    /// Structural check of a deserialized graph over `num_nodes` anchors.
    pub fn validate(&self, num_nodes: usize) -> PersistenceResult<()> {
        if self.adjacency.len() != num_nodes {
            return Err(PersistenceError::Format(format!(
                "vamana graph has {} nodes for {num_nodes} anchors",
                self.adjacency.len()
            )));
        }
        if num_nodes > 0 && self.medoid as usize >= num_nodes {
            return Err(PersistenceError::Format(format!(
                "vamana medoid {} out of range for {num_nodes} nodes",
                self.medoid
            )));
        }
        check_neighbor_ids(self.adjacency.iter().map(Vec::as_slice), num_nodes)
    }
}

/// Initialize graph with random edges.
fn initialize_random_graph(num_vectors: usize, max_degree: usize, rng: &mut StdRng) -> Vec<Vec<u32>> {
    let target = (max_degree / 2).max(2).min(num_vectors.saturating_sub(1));

    (0..num_vectors)
        .map(|i| {
            let mut neighbors: HashSet<u32> = HashSet::with_capacity(target);
            let mut list = Vec::with_capacity(target);
            while list.len() < target {
                let nb = rng.random_range(0..num_vectors as u32);
                if nb != i as u32 && neighbors.insert(nb) {
                    list.push(nb);
                }
            }
            list
        })
        .collect()
}

/// Node closest to the centroid of all nodes.
fn find_medoid(vectors: &[Vec<f32>], metric: Metric) -> u32 {
    let dim = vectors[0].len();
    let mut centroid = vec![0.0f32; dim];
    for v in vectors {
        for (c, x) in centroid.iter_mut().zip(v) {
            *c += x;
        }
    }
    let n = vectors.len() as f32;
    centroid.iter_mut().for_each(|c| *c /= n);

    let mut best_id = 0u32;
    let mut best = f32::INFINITY;
    for (i, v) in vectors.iter().enumerate() {
        let d = match metric {
            // Inner-product distance to the mean favours large norms.
            Metric::InnerProduct => Metric::L2.distance(v, &centroid),
            m => m.distance(v, &centroid),
        };
        if d < best {
            best = d;
            best_id = i as u32;
        }
    }
    best_id
}

fn pick_seeds(medoid: u32, n: usize, extra: usize, rng: &mut StdRng) -> Vec<u32> {
    let mut seeds = Vec::with_capacity(extra + 1);
    seeds.push(medoid);
    for _ in 0..extra {
        seeds.push(rng.random_range(0..n as u32));
    }
    seeds
}

/// Current neighbors plus a beam search from the seeds, deduplicated, self removed.
fn gather_candidates<F>(
    node: u32,
    graph: &[Vec<u32>],
    seeds: &[u32],
    beam_width: usize,
    dist: &F,
) -> Result<Vec<(u32, f32)>>
where
    F: Fn(u32, u32) -> f32,
{
    let mut all: Vec<(u32, f32)> = graph[node as usize]
        .iter()
        .map(|&nb| (nb, dist(node, nb)))
        .collect();

    let found = beam_search(
        seeds,
        beam_width,
        |n, buf| {
            buf.extend_from_slice(&graph[n as usize]);
            Ok(())
        },
        |id| dist(node, id),
    )?;
    all.extend(found);

    all.sort_by(|a, b| a.0.cmp(&b.0));
    all.dedup_by_key(|c| c.0);
    all.retain(|(id, _)| *id != node);
    Ok(all)
}

/// Alpha-pruning for neighbor selection.
///
/// Keeps neighbors that are not "redundant" - a candidate is redundant if
/// alpha times its distance to an already-selected neighbor is within its
/// distance to the node. Remaining slots are backfilled closest-first.
pub(crate) fn alpha_prune<F>(
    node: u32,
    candidates: &[(u32, f32)],
    max_degree: usize,
    alpha: f32,
    dist: &F,
) -> Vec<u32>
where
    F: Fn(u32, u32) -> f32,
{
    let mut sorted: Vec<(u32, f32)> = candidates.to_vec();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut selected: Vec<u32> = Vec::with_capacity(max_degree);
    'outer: for &(cand, cand_dist) in &sorted {
        if cand == node {
            continue;
        }
        for &sel in &selected {
            if alpha * dist(cand, sel) <= cand_dist {
                continue 'outer;
            }
        }
        selected.push(cand);
        if selected.len() >= max_degree {
            break;
        }
    }

    // Fill with closest if not full
    for &(cand, _) in &sorted {
        if selected.len() >= max_degree {
            break;
        }
        if cand != node && !selected.contains(&cand) {
            selected.push(cand);
        }
    }
    selected
}

/// Merge incoming edges into each node's list and re-prune.
fn symmetrize_graph<F>(graph: &mut [Vec<u32>], max_degree: usize, dist: &F, alpha: f32)
where
    F: Fn(u32, u32) -> f32,
{
    let n = graph.len();

    let mut incoming: Vec<Vec<u32>> = vec![Vec::new(); n];
    for (u, neighbors) in graph.iter().enumerate() {
        for &v in neighbors {
            incoming[v as usize].push(u as u32);
        }
    }

    for u in 0..n {
        let mut pool: Vec<(u32, f32)> = graph[u]
            .iter()
            .chain(incoming[u].iter())
            .filter(|&&v| v != u as u32)
            .map(|&v| (v, dist(u as u32, v)))
            .collect();
        pool.sort_by(|a, b| a.0.cmp(&b.0));
        pool.dedup_by_key(|c| c.0);
        graph[u] = alpha_prune(u as u32, &pool, max_degree, alpha, dist);
    }
}
