//! Reachability check for anchor graphs.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How much of the graph is reachable from its entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub reachable: usize,
    pub total: usize,
    /// Nodes no search can reach, ascending.
    pub orphans: Vec<u32>,
    /// `reachable / total`; 1.0 for an empty graph.
    pub ratio: f32,
}

impl ConnectivityReport {
    pub fn is_connected(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// BFS from `entry_point` over `neighbors`.
pub fn validate_connectivity<N>(
    entry_point: u32,
    total_nodes: usize,
    mut neighbors: N,
) -> Result<ConnectivityReport>
where
    N: FnMut(u32, &mut Vec<u32>) -> Result<()>,
{
    if total_nodes == 0 {
        return Ok(ConnectivityReport {
            reachable: 0,
            total: 0,
            orphans: Vec::new(),
            ratio: 1.0,
        });
    }

    let mut visited = vec![false; total_nodes];
    let mut queue = VecDeque::from([entry_point]);
    visited[entry_point as usize] = true;
    let mut buf = Vec::new();

    while let Some(node) = queue.pop_front() {
        buf.clear();
        neighbors(node, &mut buf)?;
        for &nb in &buf {
            let slot = &mut visited[nb as usize];
            if !*slot {
                *slot = true;
                queue.push_back(nb);
            }
        }
    }

    let orphans: Vec<u32> = visited
        .iter()
        .enumerate()
        .filter(|(_, &v)| !v)
        .map(|(i, _)| i as u32)
        .collect();
    let reachable = total_nodes - orphans.len();

    Ok(ConnectivityReport {
        reachable,
        total: total_nodes,
        orphans,
        ratio: reachable as f32 / total_nodes as f32,
    })
}
