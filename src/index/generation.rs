//! An immutable index generation plus its mutable delta segment.

use serde::{Deserialize, Serialize};

use crate::config::LeannConfig;
use crate::distance::{normalize, Metric};
use crate::error::{LeannError, Result};
use crate::graph::AnchorGraph;
use crate::partitioning::nearest_anchor;
use crate::quantization::{ProductQuantizer, QuantizerReport};
use crate::store::{DeltaSegment, DeltaStore, ItemOverride};
use crate::types::{AnchorId, DeltaRecord, ItemId, ItemMetadata};
use crate::update::GrowthStats;

/// Facts about how a generation was built. Persisted as `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub corpus_size: usize,
    pub anchor_count: usize,
    pub graph: String,
    /// Configuration snapshot the build ran with.
    pub config: LeannConfig,
    pub quantizer: QuantizerReport,
    /// Every fallback taken during the build.
    #[serde(default)]
    pub degraded: Vec<String>,
    /// Items rebuilt from reconstructions instead of fresh embeddings.
    #[serde(default)]
    pub approximated_items: usize,
}

/// Snapshot served to queries: anchors, codebooks, graph and stores.
///
/// Everything except the segment is read-only after construction.
#[derive(Debug)]
pub struct IndexGeneration {
    pub(crate) config: LeannConfig,
    pub(crate) anchors: Vec<Vec<f32>>,
    pub(crate) quantizer: ProductQuantizer,
    pub(crate) graph: AnchorGraph,
    pub(crate) store: DeltaStore,
    pub(crate) segment: DeltaSegment,
    pub(crate) metadata: BuildMetadata,
}

impl IndexGeneration {
    pub(crate) fn from_parts(
        config: LeannConfig,
        anchors: Vec<Vec<f32>>,
        quantizer: ProductQuantizer,
        graph: AnchorGraph,
        store: DeltaStore,
        segment: DeltaSegment,
        metadata: BuildMetadata,
    ) -> Result<Self> {
        if graph.len() != anchors.len() {
            return Err(LeannError::build(format!(
                "graph has {} nodes for {} anchors",
                graph.len(),
                anchors.len()
            )));
        }
        if quantizer.dimension() != config.dimension {
            return Err(LeannError::DimensionMismatch {
                expected: config.dimension,
                actual: quantizer.dimension(),
            });
        }
        Ok(Self {
            config,
            anchors,
            quantizer,
            graph,
            store,
            segment,
            metadata,
        })
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn config(&self) -> &LeannConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    pub fn anchors(&self) -> &[Vec<f32>] {
        &self.anchors
    }

    pub fn quantizer(&self) -> &ProductQuantizer {
        &self.quantizer
    }

    pub fn graph(&self) -> &AnchorGraph {
        &self.graph
    }

    pub fn store(&self) -> &DeltaStore {
        &self.store
    }

    pub fn segment(&self) -> &DeltaSegment {
        &self.segment
    }

    pub fn metadata(&self) -> &BuildMetadata {
        &self.metadata
    }

    /// Check dimension and finiteness; unit-normalize for cosine.
    pub fn prepare(&self, embedding: Vec<f32>) -> Result<Vec<f32>> {
        prepare_vector(embedding, self.config.dimension, self.config.metric)
    }

    /// Encode an item against this generation's anchors and codebooks.
    ///
    /// The owning anchor is found by brute force over all anchors.
    pub fn encode(
        &self,
        item_id: ItemId,
        embedding: Vec<f32>,
        metadata: ItemMetadata,
    ) -> Result<DeltaRecord> {
        let v = self.prepare(embedding)?;
        let (anchor_id, _) = nearest_anchor(&self.anchors, &v, self.config.metric);
        let code = self
            .quantizer
            .encode_residual(&v, &self.anchors[anchor_id as usize])?;
        Ok(DeltaRecord {
            item_id,
            anchor_id,
            code,
            metadata,
        })
    }

    /// Approximate embedding of a stored record.
    pub fn reconstruct(&self, record: &DeltaRecord) -> Result<Vec<f32>> {
        let anchor = self.anchor(record.anchor_id)?;
        self.quantizer.reconstruct(anchor, &record.code)
    }

    fn anchor(&self, id: AnchorId) -> Result<&[f32]> {
        self.anchors
            .get(id as usize)
            .map(Vec::as_slice)
            .ok_or_else(|| LeannError::query(format!("record references unknown anchor {id}")))
    }

    /// Nearest `k` anchors to `query` through the graph. Both bounds
    /// are capped at the anchor count.
    pub fn search_anchors(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<(AnchorId, f32)>> {
        let n = self.anchors.len().max(1);
        let k = k.min(n);
        self.graph.search(&self.anchors, query, k, ef.min(n).max(k))
    }

    /// The current record for `id`, honouring segment overrides.
    pub fn live_record(&self, id: ItemId) -> Option<DeltaRecord> {
        let view = self.segment.view();
        match view.lookup(id) {
            Some(ItemOverride::Live(r)) => Some(r.clone()),
            Some(ItemOverride::Removed) => None,
            None => self.store.get(id).cloned(),
        }
    }

    pub fn contains_live(&self, id: ItemId) -> bool {
        let view = self.segment.view();
        match view.lookup(id) {
            Some(ItemOverride::Live(_)) => true,
            Some(ItemOverride::Removed) => false,
            None => self.store.contains(id),
        }
    }

    /// Every live record plus the segment sequence number it reflects.
    pub fn live_snapshot(&self) -> (Vec<DeltaRecord>, u64) {
        let view = self.segment.view();
        let mut records: Vec<DeltaRecord> = self
            .store
            .records()
            .iter()
            .filter(|r| !view.touches(r.item_id))
            .cloned()
            .collect();
        records.extend(view.live_records().into_iter().cloned());
        records.sort_by_key(|r| r.item_id);
        (records, view.last_seq())
    }

    /// Segment size relative to the main store.
    pub fn growth(&self) -> GrowthStats {
        GrowthStats::new(self.segment.pending_items(), self.store.len())
    }
}

pub(crate) fn prepare_vector(mut v: Vec<f32>, dimension: usize, metric: Metric) -> Result<Vec<f32>> {
    if v.len() != dimension {
        return Err(LeannError::DimensionMismatch {
            expected: dimension,
            actual: v.len(),
        });
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(LeannError::query("embedding contains non-finite values"));
    }
    if metric == Metric::Cosine {
        v = normalize(&v);
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_normalizes_for_cosine() {
        let v = prepare_vector(vec![3.0, 4.0], 2, Metric::Cosine).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        let raw = prepare_vector(vec![3.0, 4.0], 2, Metric::L2).unwrap();
        assert_eq!(raw, vec![3.0, 4.0]);
    }

    #[test]
    fn prepare_rejects_bad_input() {
        assert!(matches!(
            prepare_vector(vec![1.0], 2, Metric::L2),
            Err(LeannError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(prepare_vector(vec![f32::NAN, 1.0], 2, Metric::L2).is_err());
    }
}
