//! Beam search shared by every graph backend.
//!
//! Standard best-first search (Malkov & Yashunin 2016; Subramanya et al. 2019):
//! - min-heap of candidates (explore closest first)
//! - max-heap of results (track worst result for pruning)
//! - stop when the best unexplored candidate is worse than the worst result
//!
//! Candidates order by `(distance, id)` so equal distances resolve the same
//! way on every run.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use crate::error::Result;

/// A node with its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub id: u32,
    pub distance: f32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        // Use total_cmp for IEEE 754 total ordering (NaN-safe)
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Beam search from `entries`.
///
/// `neighbors` fills the buffer with a node's adjacency (it may hit disk, so
/// it is fallible); `distance` scores a node against the query. Returns up to
/// `ef` nodes sorted by `(distance, id)`.
pub fn beam_search<N, D>(
    entries: &[u32],
    ef: usize,
    mut neighbors: N,
    distance: D,
) -> Result<Vec<(u32, f32)>>
where
    N: FnMut(u32, &mut Vec<u32>) -> Result<()>,
    D: Fn(u32) -> f32,
{
    let ef = ef.max(1);
    let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<Scored> = BinaryHeap::with_capacity(ef + 1);
    let mut visited: HashSet<u32> = HashSet::with_capacity(ef * 4);
    let mut buf = Vec::new();

    for &entry in entries {
        if !visited.insert(entry) {
            continue;
        }
        let s = Scored {
            id: entry,
            distance: distance(entry),
        };
        candidates.push(Reverse(s));
        results.push(s);
        if results.len() > ef {
            results.pop();
        }
    }

    while let Some(Reverse(current)) = candidates.pop() {
        if results.len() >= ef {
            if let Some(worst) = results.peek() {
                if current > *worst {
                    break;
                }
            }
        }

        buf.clear();
        neighbors(current.id, &mut buf)?;
        for &nb in &buf {
            if !visited.insert(nb) {
                continue;
            }
            let s = Scored {
                id: nb,
                distance: distance(nb),
            };
            let admit = results.len() < ef || results.peek().is_some_and(|w| s < *w);
            if admit {
                candidates.push(Reverse(s));
                results.push(s);
                if results.len() > ef {
                    results.pop();
                }
            }
        }
    }

    let mut output = results.into_vec();
    output.sort();
    Ok(output.into_iter().map(|s| (s.id, s.distance)).collect())
}
