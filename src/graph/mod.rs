//! Anchor graph index: sub-linear approximate search over anchors.
//!
//! | Backend | Layers | Where adjacency lives |
//! |---------|--------|-----------------------|
//! | [`HnswGraph`] | multi | memory |
//! | [`VamanaGraph`] | single | memory |
//! | [`DiskVamana`] | single | fixed-stride file, read per node |
//!
//! Node ids equal anchor ids. All backends search with the same
//! [`search::beam_search`], so results order by `(distance, id)` everywhere.
//!
//! Results are approximate: recall is bounded by the beam width, never exact.
//! A graph with unreachable anchors still answers; [`AnchorGraph::connectivity`]
//! reports the damage.

pub mod connectivity;
pub mod disk;
pub mod hnsw;
pub mod search;
pub mod vamana;

pub use connectivity::{validate_connectivity, ConnectivityReport};
pub use disk::{write_disk_graph, DiskGraphReader, DiskVamana};
pub use hnsw::HnswGraph;
pub use vamana::VamanaGraph;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::config::GraphBackend;
use crate::distance::Metric;
use crate::error::Result;
use crate::persistence::{PersistenceError, PersistenceResult};
use crate::types::AnchorId;

/// The graph of one index generation.
#[derive(Debug)]
pub enum AnchorGraph {
    Hnsw(HnswGraph),
    Vamana(VamanaGraph),
    OnDisk(DiskVamana),
}

/// In-memory graph as stored in `graph.bin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredGraph {
    Hnsw(HnswGraph),
    Vamana(VamanaGraph),
}

impl AnchorGraph {
    /// Build the configured backend over `anchors`.
    ///
    /// Disk-resident Vamana is built in memory here; the generation store
    /// writes and reopens it from disk.
    pub fn build(
        anchors: &[Vec<f32>],
        backend: &GraphBackend,
        metric: Metric,
        seed: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<Self> {
        match backend {
            GraphBackend::Hnsw(params) => Ok(AnchorGraph::Hnsw(HnswGraph::build(
                anchors, params, metric, seed, cancel,
            )?)),
            GraphBackend::Vamana(params) => Ok(AnchorGraph::Vamana(VamanaGraph::build(
                anchors, params, metric, seed, cancel,
            )?)),
        }
    }

    /// Up to `k` nearest anchors, sorted by `(distance, id)`.
    pub fn search(
        &self,
        anchors: &[Vec<f32>],
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<(AnchorId, f32)>> {
        if anchors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        match self {
            AnchorGraph::Hnsw(g) => g.search(anchors, query, k, ef),
            AnchorGraph::Vamana(g) => g.search(anchors, query, k, ef),
            AnchorGraph::OnDisk(g) => g.search(anchors, query, k, ef),
        }
    }

    /// BFS reachability from the entry point over the base layer.
    pub fn connectivity(&self) -> Result<ConnectivityReport> {
        match self {
            AnchorGraph::Hnsw(g) => validate_connectivity(g.entry_point(), g.len(), |n, buf| {
                buf.extend_from_slice(g.base_neighbors(n));
                Ok(())
            }),
            AnchorGraph::Vamana(g) => validate_connectivity(g.medoid, g.len(), |n, buf| {
                buf.extend_from_slice(&g.adjacency[n as usize]);
                Ok(())
            }),
            AnchorGraph::OnDisk(g) => {
                validate_connectivity(g.entry_point(), g.len(), |n, buf| g.neighbors(n, buf))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AnchorGraph::Hnsw(g) => g.len(),
            AnchorGraph::Vamana(g) => g.len(),
            AnchorGraph::OnDisk(g) => g.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Structural check of a loaded graph against the anchor table.
    pub fn validate(&self, num_anchors: usize) -> PersistenceResult<()> {
        match self {
            AnchorGraph::Hnsw(g) => g.validate(num_anchors),
            AnchorGraph::Vamana(g) => g.validate(num_anchors),
            AnchorGraph::OnDisk(g) => {
                if g.len() != num_anchors {
                    return Err(PersistenceError::Format(format!(
                        "disk graph has {} nodes for {num_anchors} anchors",
                        g.len()
                    )));
                }
                // Adjacency reads reject out-of-range ids.
                let mut buf = Vec::new();
                for node in 0..g.len() as u32 {
                    buf.clear();
                    g.reader().neighbors(node, &mut buf)?;
                }
                Ok(())
            }
        }
    }

    /// Short backend name for logs and metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            AnchorGraph::Hnsw(_) => "hnsw",
            AnchorGraph::Vamana(_) => "vamana",
            AnchorGraph::OnDisk(_) => "vamana-disk",
        }
    }
}

/// Every neighbor id must name one of `num_nodes` nodes.
pub(crate) fn check_neighbor_ids<'a>(
    lists: impl Iterator<Item = &'a [u32]>,
    num_nodes: usize,
) -> PersistenceResult<()> {
    for (node, list) in lists.enumerate() {
        if let Some(&bad) = list.iter().find(|&&id| id as usize >= num_nodes) {
            return Err(PersistenceError::Format(format!(
                "node {node} links to {bad}, only {num_nodes} nodes"
            )));
        }
    }
    Ok(())
}

impl From<StoredGraph> for AnchorGraph {
    fn from(g: StoredGraph) -> Self {
        match g {
            StoredGraph::Hnsw(g) => AnchorGraph::Hnsw(g),
            StoredGraph::Vamana(g) => AnchorGraph::Vamana(g),
        }
    }
}
