//! HNSW over anchors.
//!
//! Implements the insertion algorithm from the HNSW paper (Malkov & Yashunin, 2018):
//!
//! 1. Draw the node's top layer `l = floor(-ln(U) / ln(m))`, capped at `max_level`.
//! 2. Descend from the current entry point with ef=1 down to layer `l + 1`.
//! 3. On each layer `<= l`, run an `ef_construction` beam search, pick neighbors
//!    (closest-M or RND), connect both ways, and prune any overfull reverse list.
//!
//! Anchors are known up front, so the build is offline: node ids are inserted
//! in order and each node only links to nodes inserted before it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use super::check_neighbor_ids;
use super::search::beam_search;
use crate::cancel::CancelToken;
use crate::config::{HnswParams, NeighborSelection};
use crate::distance::Metric;
use crate::error::{LeannError, Result};
use crate::persistence::{PersistenceError, PersistenceResult};

type Adjacency = SmallVec<[u32; 16]>;

/// Multi-layer proximity graph over anchor ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    params: HnswParams,
    metric: Metric,
    /// Top layer of each node.
    levels: Vec<u8>,
    /// `layers[l][node]`; empty for nodes whose level is below `l`.
    layers: Vec<Vec<Adjacency>>,
    entry_point: u32,
}

impl HnswGraph {
    /// Build over `vectors`. Node `i` is anchor `i`.
    pub fn build(
        vectors: &[Vec<f32>],
        params: &HnswParams,
        metric: Metric,
        seed: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<Self> {
        let n = vectors.len();
        if n == 0 {
            return Err(LeannError::build("cannot build HNSW over zero anchors"));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let ml = 1.0 / (params.m.max(2) as f64).ln();
        let levels: Vec<u8> = (0..n)
            .map(|_| {
                // U in (0, 1] so ln(U) is finite.
                let u: f64 = 1.0 - rng.random::<f64>();
                let level = (-u.ln() * ml).floor() as usize;
                level.min(params.max_level).min(u8::MAX as usize) as u8
            })
            .collect();
        let max_layer = levels.iter().copied().max().unwrap_or(0) as usize;

        let mut graph = Self {
            params: params.clone(),
            metric,
            levels,
            layers: vec![vec![Adjacency::new(); n]; max_layer + 1],
            entry_point: 0,
        };

        let dist = |a: u32, b: u32| metric.distance(&vectors[a as usize], &vectors[b as usize]);

        for current in 1..n as u32 {
            if current % 256 == 0 {
                if let Some(token) = cancel {
                    token.check()?;
                }
            }
            graph.insert(current, &dist)?;
        }

        debug!(
            nodes = n,
            layers = max_layer + 1,
            entry = graph.entry_point,
            "HNSW graph built"
        );
        Ok(graph)
    }

    fn insert<F>(&mut self, current: u32, dist: &F) -> Result<()>
    where
        F: Fn(u32, u32) -> f32,
    {
        let current_layer = self.levels[current as usize] as usize;
        let entry_layer = self.levels[self.entry_point as usize] as usize;
        let mut layer_entry = self.entry_point;
        let query = |id: u32| dist(current, id);

        // 1) Descend with ef=1; only refines the entry point.
        if entry_layer > current_layer {
            for layer in ((current_layer + 1)..=entry_layer).rev() {
                let found = beam_search(
                    &[layer_entry],
                    1,
                    |n, buf| {
                        buf.extend_from_slice(&self.layers[layer][n as usize]);
                        Ok(())
                    },
                    query,
                )?;
                if let Some(&(best, _)) = found.first() {
                    layer_entry = best;
                }
            }
        }

        // 2) Connect on every shared layer.
        for layer in (0..=current_layer.min(entry_layer)).rev() {
            let candidates = beam_search(
                &[layer_entry],
                self.params.ef_construction,
                |n, buf| {
                    buf.extend_from_slice(&self.layers[layer][n as usize]);
                    Ok(())
                },
                query,
            )?;
            if let Some(&(best, _)) = candidates.first() {
                layer_entry = best;
            }

            let cap = self.layer_cap(layer);
            let selected = select_neighbors(&candidates, cap, self.params.selection, dist);

            self.layers[layer][current as usize] = selected.iter().copied().collect();
            for &nb in &selected {
                let list = &mut self.layers[layer][nb as usize];
                if !list.contains(&current) {
                    list.push(current);
                }
                if list.len() > cap {
                    let pool: Vec<(u32, f32)> =
                        list.iter().map(|&id| (id, dist(nb, id))).collect();
                    let pruned = select_neighbors(&pool, cap, self.params.selection, dist);
                    *list = pruned.into_iter().collect();
                }
            }
        }

        // 3) New top layer becomes the entry point.
        if current_layer > entry_layer {
            self.entry_point = current;
        }
        Ok(())
    }

    fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m_max0
        } else {
            self.params.m
        }
    }

    /// k nearest anchors to `query`, sorted by `(distance, id)`.
    pub fn search(
        &self,
        vectors: &[Vec<f32>],
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<(u32, f32)>> {
        let dist = |id: u32| self.metric.distance(query, &vectors[id as usize]);
        let top = self.layers.len() - 1;
        let mut entry = self.entry_point;

        for layer in (1..=top).rev() {
            let found = beam_search(
                &[entry],
                1,
                |n, buf| {
                    buf.extend_from_slice(&self.layers[layer][n as usize]);
                    Ok(())
                },
                dist,
            )?;
            if let Some(&(best, _)) = found.first() {
                entry = best;
            }
        }

        let mut out = beam_search(
            &[entry],
            ef.max(k),
            |n, buf| {
                buf.extend_from_slice(&self.layers[0][n as usize]);
                Ok(())
            },
            dist,
        )?;
        out.truncate(k);
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Layer-0 adjacency of `node`.
    pub fn base_neighbors(&self, node: u32) -> &[u32] {
        &self.layers[0][node as usize]
    }

    /// Structural check of a deserialized graph over `num_nodes` anchors.
    pub fn validate(&self, num_nodes: usize) -> PersistenceResult<()> {
        if self.levels.len() != num_nodes {
            return Err(PersistenceError::Format(format!(
                "hnsw graph has {} nodes for {num_nodes} anchors",
                self.levels.len()
            )));
        }
        if num_nodes == 0 {
            return Ok(());
        }
        if self.layers.is_empty() || self.entry_point as usize >= num_nodes {
            return Err(PersistenceError::Format(format!(
                "hnsw graph: entry point {} over {} layers",
                self.entry_point,
                self.layers.len()
            )));
        }
        for (layer, nodes) in self.layers.iter().enumerate() {
            if nodes.len() != num_nodes {
                return Err(PersistenceError::Format(format!(
                    "hnsw layer {layer} has {} nodes, expected {num_nodes}",
                    nodes.len()
                )));
            }
            check_neighbor_ids(nodes.iter().map(|adj| adj.as_slice()), num_nodes)?;
        }
        Ok(())
    }
}

/// Pick up to `m` neighbors from `candidates` (`(id, distance-to-query)`).
pub(crate) fn select_neighbors<F>(
    candidates: &[(u32, f32)],
    m: usize,
    selection: NeighborSelection,
    dist: &F,
) -> Vec<u32>
where
    F: Fn(u32, u32) -> f32,
{
    let mut sorted: Vec<(u32, f32)> = candidates.to_vec();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    match selection {
        NeighborSelection::Closest => sorted.into_iter().take(m).map(|(id, _)| id).collect(),
        NeighborSelection::Diverse => select_neighbors_rnd(&sorted, m, dist),
    }
}

/// RND: include candidate `j` if it is closer to the query than to every
/// already-selected neighbor `i`. Backfills with the closest remaining.
fn select_neighbors_rnd<F>(sorted: &[(u32, f32)], m: usize, dist: &F) -> Vec<u32>
where
    F: Fn(u32, u32) -> f32,
{
    let mut selected: Vec<u32> = Vec::with_capacity(m.min(sorted.len()));
    for &(candidate, to_query) in sorted {
        if selected.len() >= m {
            break;
        }
        if selected.iter().all(|&s| to_query < dist(s, candidate)) {
            selected.push(candidate);
        }
    }

    // If we still need more neighbors, add closest remaining
    for &(candidate, _) in sorted {
        if selected.len() >= m {
            break;
        }
        if !selected.contains(&candidate) {
            selected.push(candidate);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<Vec<f32>> {
        (0..n * n)
            .map(|i| vec![(i % n) as f32, (i / n) as f32])
            .collect()
    }

    #[test]
    fn finds_exact_node() {
        let vectors = grid(12);
        let params = HnswParams {
            m: 6,
            m_max0: 12,
            ef_construction: 40,
            ..HnswParams::default()
        };
        let g = HnswGraph::build(&vectors, &params, Metric::L2, 3, None).unwrap();
        for target in [0usize, 17, 77, 143] {
            let out = g.search(&vectors, &vectors[target], 1, 32).unwrap();
            assert_eq!(out[0].0 as usize, target);
        }
    }

    #[test]
    fn degrees_respect_caps() {
        let vectors = grid(10);
        let params = HnswParams {
            m: 4,
            m_max0: 8,
            ef_construction: 32,
            selection: NeighborSelection::Closest,
            ..HnswParams::default()
        };
        let g = HnswGraph::build(&vectors, &params, Metric::L2, 1, None).unwrap();
        for (layer, nodes) in g.layers.iter().enumerate() {
            let cap = if layer == 0 { 8 } else { 4 };
            assert!(nodes.iter().all(|adj| adj.len() <= cap));
        }
    }

    #[test]
    fn dangling_neighbor_fails_validation() {
        let vectors = grid(6);
        let mut g = HnswGraph::build(&vectors, &HnswParams::default(), Metric::L2, 2, None).unwrap();
        g.validate(36).unwrap();
        assert!(g.validate(35).is_err());

        g.layers[0][3].push(36);
        let err = g.validate(36).unwrap_err();
        assert!(err.is_structural(), "{err}");
    }

    #[test]
    fn same_seed_same_graph() {
        let vectors = grid(8);
        let params = HnswParams::default();
        let a = HnswGraph::build(&vectors, &params, Metric::L2, 9, None).unwrap();
        let b = HnswGraph::build(&vectors, &params, Metric::L2, 9, None).unwrap();
        assert_eq!(a.levels, b.levels);
        assert_eq!(a.layers, b.layers);
    }

    #[test]
    fn single_node_graph_answers() {
        let vectors = vec![vec![1.0, 0.0]];
        let g = HnswGraph::build(&vectors, &HnswParams::default(), Metric::Cosine, 0, None).unwrap();
        let out = g.search(&vectors, &[0.0, 1.0], 3, 8).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 0);
    }

    #[test]
    fn rnd_skips_redundant_candidates() {
        // 1 and 2 nearly coincide; 3 points the other way.
        let pts = [[0.0f32, 0.0], [1.0, 0.0], [1.05, 0.0], [-1.0, 0.0]];
        let dist = |a: u32, b: u32| {
            let (p, q) = (pts[a as usize], pts[b as usize]);
            ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)).sqrt()
        };
        let candidates = vec![(1, 1.0), (2, 1.05), (3, 1.0)];
        let out = select_neighbors(&candidates, 2, NeighborSelection::Diverse, &dist);
        assert_eq!(out, vec![1, 3]);
    }
}
