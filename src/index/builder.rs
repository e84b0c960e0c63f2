//! Batch build pipeline: select anchors, build the graph, train PQ, encode.
//!
//! Single writer; the data-parallel stages (assignment, encoding, validation)
//! fan out with rayon over read-only inputs. The cancel token is checked
//! between stages and inside the long-running ones.

use std::collections::HashSet;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::generation::{prepare_vector, BuildMetadata, IndexGeneration};
use crate::cancel::CancelToken;
use crate::config::LeannConfig;
use crate::distance::row;
use crate::error::{LeannError, Result};
use crate::graph::AnchorGraph;
use crate::partitioning::AnchorSelector;
use crate::quantization::{train_residual_quantizer, ResidualSet};
use crate::store::{DeltaSegment, DeltaStore};
use crate::types::{DeltaRecord, Item};

/// Builds one [`IndexGeneration`] from embedded items.
pub struct IndexBuilder<'a> {
    config: &'a LeannConfig,
    version: u64,
    cancel: Option<&'a CancelToken>,
    degraded: Vec<String>,
    approximated_items: usize,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(config: &'a LeannConfig) -> Self {
        Self {
            config,
            version: 1,
            cancel: None,
            degraded: Vec::new(),
            approximated_items: 0,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Record items whose vectors are reconstructions, not fresh embeddings.
    #[must_use]
    pub(crate) fn with_approximated(mut self, count: usize) -> Self {
        self.approximated_items = count;
        if count > 0 {
            self.degraded
                .push(format!("{count} items rebuilt from approximate vectors"));
        }
        self
    }

    pub fn build(self, items: Vec<Item>) -> Result<IndexGeneration> {
        let Self {
            config,
            version,
            cancel,
            mut degraded,
            approximated_items,
        } = self;
        let checkpoint = || cancel.map_or(Ok(()), CancelToken::check);
        config.validate()?;
        if items.is_empty() {
            return Err(LeannError::build("cannot build an index from zero items"));
        }

        let start = Instant::now();
        let dim = config.dimension;
        let n = items.len();
        info!(version, items = n, dim, "index build started");

        let mut seen = HashSet::with_capacity(n);
        let mut vectors = Vec::with_capacity(n * dim);
        let mut ids = Vec::with_capacity(n);
        let mut metadata = Vec::with_capacity(n);
        for item in items {
            if !seen.insert(item.id) {
                return Err(LeannError::build(format!("duplicate item id {}", item.id)));
            }
            let v = prepare_vector(item.embedding, dim, config.metric).map_err(|e| match e {
                LeannError::Query(msg) => LeannError::build(format!("item {}: {msg}", item.id)),
                other => other,
            })?;
            vectors.extend_from_slice(&v);
            ids.push(item.id);
            metadata.push(item.metadata);
        }

        // 1) Anchors
        checkpoint()?;
        let mut selector = AnchorSelector::new(&config.anchors, config.metric, dim, config.seed);
        if let Some(token) = cancel {
            selector = selector.with_cancel(token);
        }
        let selection = selector.select(&vectors, &metadata)?;
        if let Some(reason) = &selection.degraded {
            degraded.push(format!("anchor selection: {reason}"));
        }
        info!(
            anchors = selection.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "anchors selected"
        );

        // 2) Graph
        checkpoint()?;
        let graph = AnchorGraph::build(
            &selection.anchors,
            &config.graph,
            config.metric,
            config.seed,
            cancel,
        )?;
        let connectivity = graph.connectivity()?;
        if !connectivity.is_connected() {
            warn!(
                orphans = connectivity.orphans.len(),
                ratio = connectivity.ratio,
                "anchor graph has unreachable nodes"
            );
            degraded.push(format!(
                "{} of {} anchors unreachable from the entry point",
                connectivity.orphans.len(),
                connectivity.total
            ));
        }
        info!(
            kind = graph.kind(),
            nodes = graph.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "anchor graph built"
        );

        // 3) Quantizer
        checkpoint()?;
        let residuals = ResidualSet {
            vectors: &vectors,
            anchors: &selection.anchors,
            assignments: &selection.assignments,
            dimension: dim,
        };
        let (quantizer, report) =
            train_residual_quantizer(&config.quantizer, &residuals, config.seed, cancel)?;
        if let Some(reason) = &report.degraded {
            degraded.push(format!("quantizer: {reason}"));
        }

        // 4) Encode
        checkpoint()?;
        let records: Vec<DeltaRecord> = metadata
            .into_par_iter()
            .enumerate()
            .map(|(i, meta)| -> Result<DeltaRecord> {
                let anchor_id = selection.assignments[i];
                let code = quantizer.encode_residual(
                    row(&vectors, dim, i),
                    &selection.anchors[anchor_id as usize],
                )?;
                Ok(DeltaRecord {
                    item_id: ids[i],
                    anchor_id,
                    code,
                    metadata: meta,
                })
            })
            .collect::<Result<_>>()?;
        debug!(records = records.len(), "residuals encoded");

        checkpoint()?;
        let anchor_count = selection.anchors.len();
        let store = DeltaStore::from_records(records, anchor_count)?;
        let metadata = BuildMetadata {
            version,
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as u64),
            corpus_size: n,
            anchor_count,
            graph: graph.kind().to_string(),
            config: config.clone(),
            quantizer: report,
            degraded,
            approximated_items,
        };

        info!(
            version,
            items = n,
            anchors = anchor_count,
            degraded = metadata.degraded.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "index build finished"
        );

        IndexGeneration::from_parts(
            config.clone(),
            selection.anchors,
            quantizer,
            graph,
            store,
            DeltaSegment::new(),
            metadata,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnchorConfig, QuantizerConfig};
    use crate::types::ItemMetadata;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small_config() -> LeannConfig {
        let mut config = LeannConfig::with_dimension(16);
        config.anchors = AnchorConfig {
            count: 8,
            ..AnchorConfig::default()
        };
        config.quantizer = QuantizerConfig {
            sub_vectors: 4,
            codebook_size: 16,
            training_samples: 512,
            validation_samples: 64,
            ..QuantizerConfig::default()
        };
        config
    }

    fn items(n: usize, dim: usize, seed: u64) -> Vec<Item> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let v: Vec<f32> = (0..dim).map(|_| rng.random::<f32>() - 0.5).collect();
                Item::new(i as u64, v, ItemMetadata::with_path(format!("f{i}.rs")))
            })
            .collect()
    }

    #[test]
    fn builds_every_item_into_the_store() {
        let config = small_config();
        let generation = IndexBuilder::new(&config).build(items(200, 16, 1)).unwrap();
        assert_eq!(generation.store().len(), 200);
        assert_eq!(generation.anchors().len(), 8);
        assert_eq!(generation.graph().len(), 8);
        assert_eq!(
            generation.store().member_counts().iter().sum::<usize>(),
            200
        );
        assert_eq!(generation.version(), 1);
    }

    #[test]
    fn same_input_same_generation() {
        let config = small_config();
        let a = IndexBuilder::new(&config).build(items(150, 16, 2)).unwrap();
        let b = IndexBuilder::new(&config).build(items(150, 16, 2)).unwrap();
        assert_eq!(a.anchors(), b.anchors());
        assert_eq!(a.store().records(), b.store().records());
    }

    #[test]
    fn cancelled_build_stops() {
        let config = small_config();
        let token = CancelToken::new();
        token.cancel();
        let err = IndexBuilder::new(&config)
            .with_cancel(&token)
            .build(items(50, 16, 3))
            .unwrap_err();
        assert!(matches!(err, LeannError::Cancelled));
    }

    #[test]
    fn rejects_empty_and_duplicate_input() {
        let config = small_config();
        assert!(matches!(
            IndexBuilder::new(&config).build(Vec::new()),
            Err(LeannError::Build(_))
        ));
        let mut dup = items(20, 16, 4);
        dup[1].id = 0;
        assert!(matches!(
            IndexBuilder::new(&config).build(dup),
            Err(LeannError::Build(_))
        ));
    }

    #[test]
    fn small_corpus_is_degraded_not_fatal() {
        let config = small_config();
        let generation = IndexBuilder::new(&config).build(items(5, 16, 5)).unwrap();
        assert_eq!(generation.anchors().len(), 5);
        assert!(!generation.metadata().degraded.is_empty());
    }
}
