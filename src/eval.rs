//! Recall measurement against exact search.
//!
//! | Metric | Formula |
//! |--------|---------|
//! | Recall@K | \|approx ∩ true\| / K |
//! | MRR | 1 / rank of the first true neighbor |
//!
//! Ground truth is a brute-force scan over full-precision vectors, using the
//! same score and tie-break (score descending, id ascending) as the query
//! engine.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::distance::Metric;
use crate::error::Result;
use crate::query::{QueryEngine, QueryRequest};
use crate::types::{Item, ItemId};

/// Exact top-`k` ids for `query` over `corpus`.
pub fn brute_force_top_k(corpus: &[Item], query: &[f32], k: usize, metric: Metric) -> Vec<ItemId> {
    let mut scored: Vec<(f32, ItemId)> = corpus
        .par_iter()
        .map(|item| (metric.similarity(query, &item.embedding), item.id))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.truncate(k);
    scored.into_iter().map(|(_, id)| id).collect()
}

/// Recall@k for a single query.
pub fn recall_at_k(approx: &[ItemId], truth: &[ItemId], k: usize) -> f32 {
    let k = k.min(truth.len());
    if k == 0 {
        return 0.0;
    }
    let true_set: HashSet<ItemId> = truth.iter().take(k).copied().collect();
    let found = approx.iter().take(k).filter(|id| true_set.contains(id)).count();
    found as f32 / k as f32
}

/// Reciprocal rank of the first true neighbor, 0 if none was returned.
pub fn mrr(approx: &[ItemId], truth: &[ItemId]) -> f32 {
    let true_set: HashSet<ItemId> = truth.iter().copied().collect();
    approx
        .iter()
        .position(|id| true_set.contains(id))
        .map_or(0.0, |rank| 1.0 / (rank + 1) as f32)
}

#[derive(Debug, Clone)]
pub struct RecallReport {
    pub k: usize,
    pub recalls: Vec<f32>,
    pub latencies: Vec<Duration>,
}

impl RecallReport {
    pub fn mean_recall(&self) -> f32 {
        if self.recalls.is_empty() {
            return 0.0;
        }
        self.recalls.iter().sum::<f32>() / self.recalls.len() as f32
    }

    pub fn min_recall(&self) -> f32 {
        self.recalls.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn mean_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32
    }

    pub fn summary(&self) -> String {
        format!(
            "Recall@{}: {:.3} (min {:.3}) | {:.0}us/query over {} queries",
            self.k,
            self.mean_recall(),
            self.min_recall(),
            self.mean_latency().as_secs_f64() * 1e6,
            self.recalls.len()
        )
    }
}

/// Run `queries` through `engine` and compare against exact search over
/// `corpus`. `configure` adjusts each request (e.g. `ef_search`).
pub fn evaluate<F>(
    engine: &QueryEngine,
    corpus: &[Item],
    queries: &[Vec<f32>],
    k: usize,
    configure: F,
) -> Result<RecallReport>
where
    F: Fn(QueryRequest) -> QueryRequest,
{
    let metric = engine.handle().require()?.metric();
    let mut recalls = Vec::with_capacity(queries.len());
    let mut latencies = Vec::with_capacity(queries.len());
    for query in queries {
        let truth = brute_force_top_k(corpus, query, k, metric);
        let start = Instant::now();
        let response = engine.search(&configure(QueryRequest::vector(query.clone()).top_k(k)))?;
        latencies.push(start.elapsed());
        recalls.push(recall_at_k(&response.ids(), &truth, k));
    }
    Ok(RecallReport {
        k,
        recalls,
        latencies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemMetadata;

    #[test]
    fn recall_counts_overlap_in_the_first_k() {
        assert_eq!(recall_at_k(&[1, 2, 3], &[1, 2, 3], 3), 1.0);
        assert_eq!(recall_at_k(&[1, 9, 3], &[1, 2, 3], 3), 2.0 / 3.0);
        assert_eq!(recall_at_k(&[], &[1, 2], 2), 0.0);
        assert_eq!(recall_at_k(&[1], &[], 2), 0.0);
    }

    #[test]
    fn mrr_uses_first_hit() {
        assert_eq!(mrr(&[5, 1, 2], &[1, 2]), 0.5);
        assert_eq!(mrr(&[5, 6], &[1]), 0.0);
    }

    #[test]
    fn brute_force_orders_by_score_then_id() {
        let corpus = vec![
            Item::new(3, vec![1.0, 0.0], ItemMetadata::default()),
            Item::new(1, vec![1.0, 0.0], ItemMetadata::default()),
            Item::new(2, vec![0.0, 1.0], ItemMetadata::default()),
        ];
        let top = brute_force_top_k(&corpus, &[1.0, 0.0], 2, Metric::Cosine);
        assert_eq!(top, vec![1, 3]);
    }
}
