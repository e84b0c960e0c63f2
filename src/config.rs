//! # Configuration
//!
//! Typed configuration for every stage of the index. Strategy choices
//! (anchor selection, graph backend) are tagged enums selected here, never by
//! inspecting types at runtime.
//!
//! Loading configuration *files* is the caller's business; this module only
//! parses a JSON document and validates it. Every check in
//! [`LeannConfig::validate`] fails fast: invalid values are rejected, never
//! replaced by defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::distance::Metric;
use crate::error::{LeannError, Result};

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeannConfig {
    /// Embedding dimension D.
    pub dimension: usize,
    pub metric: Metric,
    /// Seed for every randomized stage. Same seed + same corpus = same build.
    pub seed: u64,
    pub anchors: AnchorConfig,
    pub graph: GraphBackend,
    pub quantizer: QuantizerConfig,
    pub query: QueryConfig,
    pub update: UpdateConfig,
    pub health: HealthConfig,
    pub collaborators: CollaboratorConfig,
}

impl Default for LeannConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            metric: Metric::Cosine,
            seed: 42,
            anchors: AnchorConfig::default(),
            graph: GraphBackend::default(),
            quantizer: QuantizerConfig::default(),
            query: QueryConfig::default(),
            update: UpdateConfig::default(),
            health: HealthConfig::default(),
            collaborators: CollaboratorConfig::default(),
        }
    }
}

/// Anchor selection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Target anchor count M. Effective count is `min(M, N)`.
    pub count: usize,
    pub strategy: AnchorStrategy,
    /// Upper bound on points fed to k-means.
    pub samples: usize,
    pub max_iterations: usize,
    /// Stop when the largest centroid shift (L2) falls below this.
    pub tolerance: f32,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            count: 100,
            strategy: AnchorStrategy::KMeans,
            samples: 2048,
            max_iterations: 25,
            tolerance: 1e-4,
        }
    }
}

/// How anchors are chosen from the corpus.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AnchorStrategy {
    /// Uniform sample without replacement.
    Random,
    /// k-means centroids.
    #[default]
    KMeans,
    /// k-means run separately per metadata group.
    StratifiedKMeans {
        group_by: GroupKey,
        quota: Quota,
        min_per_group: usize,
    },
    /// Greedy farthest-point selection.
    MaxCoverage { diversity_threshold: f32 },
}

/// Metadata field used to form strata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupKey {
    Language,
    Kind,
}

/// Per-group anchor quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Quota {
    Proportional,
    Uniform,
}

/// Anchor graph backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GraphBackend {
    Hnsw(HnswParams),
    Vamana(VamanaParams),
}

impl Default for GraphBackend {
    fn default() -> Self {
        GraphBackend::Hnsw(HnswParams::default())
    }
}

impl GraphBackend {
    /// Default query-time beam width for this backend.
    pub fn default_ef(&self) -> usize {
        match self {
            GraphBackend::Hnsw(p) => p.ef_search,
            GraphBackend::Vamana(p) => p.search_beam_width,
        }
    }
}

/// HNSW parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    /// Max connections per node on upper layers.
    pub m: usize,
    /// Max connections on layer 0.
    pub m_max0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_level: usize,
    pub selection: NeighborSelection,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            m_max0: 32,
            ef_construction: 200,
            ef_search: 64,
            max_level: 8,
            selection: NeighborSelection::Diverse,
        }
    }
}

/// Neighbor selection heuristic used when connecting a new node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NeighborSelection {
    /// Keep the M closest candidates.
    Closest,
    /// Relative-neighborhood diversification.
    #[default]
    Diverse,
}

/// Vamana parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VamanaParams {
    /// Max out-degree R.
    pub max_degree: usize,
    /// Construction beam width L.
    pub build_beam_width: usize,
    /// Pruning aggressiveness; >1 keeps longer edges.
    pub alpha: f32,
    pub passes: usize,
    /// Extra random seeds for each construction search.
    pub extra_seeds: usize,
    pub search_beam_width: usize,
    /// Keep adjacency in a fixed-stride file instead of memory.
    pub on_disk: bool,
}

impl Default for VamanaParams {
    fn default() -> Self {
        Self {
            max_degree: 32,
            build_beam_width: 64,
            alpha: 1.2,
            passes: 2,
            extra_seeds: 2,
            search_beam_width: 64,
            on_disk: false,
        }
    }
}

/// Residual quantizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizerConfig {
    /// Number of segments S. Must divide the dimension.
    pub sub_vectors: usize,
    /// Centroids per segment, 2..=256.
    pub codebook_size: usize,
    pub training_samples: usize,
    pub validation_samples: usize,
    pub max_iterations: usize,
    /// Target mean relative reconstruction error.
    pub max_error: f32,
    /// Retrain once with a doubled codebook when `max_error` is exceeded.
    pub retry_larger_codebook: bool,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            sub_vectors: 16,
            codebook_size: 256,
            training_samples: 4096,
            validation_samples: 512,
            max_iterations: 15,
            max_error: 0.2,
            retry_larger_codebook: true,
        }
    }
}

/// Query defaults. Every field can be overridden per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub top_k: usize,
    pub candidate_multiplier: usize,
    /// Lower bound on searched anchors regardless of `top_k`.
    pub min_candidate_anchors: usize,
    pub timeout_ms: Option<u64>,
    pub on_timeout: TimeoutPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            candidate_multiplier: 4,
            min_candidate_anchors: 8,
            timeout_ms: None,
            on_timeout: TimeoutPolicy::Partial,
        }
    }
}

/// What a query does when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPolicy {
    /// Return what was scored so far, flagged partial.
    #[default]
    Partial,
    /// Fail with a timeout error.
    Fail,
}

/// Incremental update configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Pending segment items that mandate a rebuild.
    pub delta_index_threshold: usize,
    /// Segment / main ratio that mandates a rebuild.
    pub max_delta_ratio: f32,
    /// Scheduled rebuild period.
    pub rebuild_interval_secs: Option<u64>,
    /// Rebuild when health drops below configured minimums.
    pub rebuild_on_unhealthy: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            delta_index_threshold: 10_000,
            max_delta_ratio: 0.2,
            rebuild_interval_secs: None,
            rebuild_on_unhealthy: true,
        }
    }
}

impl UpdateConfig {
    pub fn rebuild_interval(&self) -> Option<Duration> {
        self.rebuild_interval_secs.map(Duration::from_secs)
    }
}

/// Health validation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub min_coverage: f32,
    pub max_quantization_error: f32,
    pub min_balance: f32,
    pub min_connectivity: f32,
    /// Items sampled for the coverage check.
    pub coverage_samples: usize,
    /// Scores below this are unhealthy rather than degraded.
    pub unhealthy_below: f32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_coverage: 0.9,
            max_quantization_error: 0.25,
            min_balance: 0.3,
            min_connectivity: 0.95,
            coverage_samples: 256,
            unhealthy_below: 0.5,
        }
    }
}

/// Embedding and rerank collaborator policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub embed_batch_size: usize,
    pub embed_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: 32,
            embed_timeout_ms: 30_000,
            rerank_timeout_ms: 10_000,
            max_retries: 2,
            retry_backoff_ms: 100,
        }
    }
}

impl LeannConfig {
    /// Config for `dimension`-d embeddings with everything else defaulted.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: LeannConfig = serde_json::from_str(s)
            .map_err(|e| LeannError::config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// JSON snapshot, stored in build metadata.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LeannError::config(format!("failed to serialize configuration: {e}")))
    }

    /// Reject invalid values.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, v: usize) -> Result<()> {
            if v == 0 {
                return Err(LeannError::config(format!("{name} must be > 0")));
            }
            Ok(())
        }
        fn unit(name: &str, v: f32) -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(LeannError::config(format!("{name} must be in [0, 1], got {v}")));
            }
            Ok(())
        }

        positive("dimension", self.dimension)?;

        let a = &self.anchors;
        positive("anchors.count", a.count)?;
        positive("anchors.samples", a.samples)?;
        positive("anchors.max_iterations", a.max_iterations)?;
        if !(a.tolerance >= 0.0) {
            return Err(LeannError::config("anchors.tolerance must be >= 0"));
        }
        match &a.strategy {
            AnchorStrategy::MaxCoverage {
                diversity_threshold,
            } if !(*diversity_threshold >= 0.0) => {
                return Err(LeannError::config(
                    "anchors.strategy.diversity_threshold must be >= 0",
                ));
            }
            AnchorStrategy::StratifiedKMeans { min_per_group, .. } if *min_per_group > a.count => {
                return Err(LeannError::config(format!(
                    "anchors.strategy.min_per_group ({min_per_group}) exceeds anchors.count ({})",
                    a.count
                )));
            }
            _ => {}
        }

        match &self.graph {
            GraphBackend::Hnsw(p) => {
                if p.m < 2 {
                    return Err(LeannError::config("graph.m must be >= 2"));
                }
                if p.m_max0 < p.m {
                    return Err(LeannError::config("graph.m_max0 must be >= graph.m"));
                }
                positive("graph.ef_construction", p.ef_construction)?;
                positive("graph.ef_search", p.ef_search)?;
            }
            GraphBackend::Vamana(p) => {
                positive("graph.max_degree", p.max_degree)?;
                positive("graph.search_beam_width", p.search_beam_width)?;
                positive("graph.passes", p.passes)?;
                if p.build_beam_width < p.max_degree {
                    return Err(LeannError::config(
                        "graph.build_beam_width must be >= graph.max_degree",
                    ));
                }
                if !(p.alpha >= 1.0) {
                    return Err(LeannError::config(format!(
                        "graph.alpha must be >= 1.0, got {}",
                        p.alpha
                    )));
                }
            }
        }

        let q = &self.quantizer;
        positive("quantizer.sub_vectors", q.sub_vectors)?;
        if self.dimension % q.sub_vectors != 0 {
            return Err(LeannError::config(format!(
                "dimension ({}) must be divisible by quantizer.sub_vectors ({})",
                self.dimension, q.sub_vectors
            )));
        }
        if !(2..=256).contains(&q.codebook_size) {
            return Err(LeannError::config(format!(
                "quantizer.codebook_size must be in [2, 256], got {}",
                q.codebook_size
            )));
        }
        positive("quantizer.training_samples", q.training_samples)?;
        positive("quantizer.max_iterations", q.max_iterations)?;
        if !(q.max_error > 0.0) {
            return Err(LeannError::config("quantizer.max_error must be > 0"));
        }

        positive("query.top_k", self.query.top_k)?;
        positive("query.candidate_multiplier", self.query.candidate_multiplier)?;

        positive("update.delta_index_threshold", self.update.delta_index_threshold)?;
        if !(self.update.max_delta_ratio > 0.0) {
            return Err(LeannError::config("update.max_delta_ratio must be > 0"));
        }

        let h = &self.health;
        unit("health.min_coverage", h.min_coverage)?;
        unit("health.min_balance", h.min_balance)?;
        unit("health.min_connectivity", h.min_connectivity)?;
        unit("health.unhealthy_below", h.unhealthy_below)?;

        positive("collaborators.embed_batch_size", self.collaborators.embed_batch_size)?;
        if self.collaborators.embed_timeout_ms == 0 || self.collaborators.rerank_timeout_ms == 0 {
            return Err(LeannError::config("collaborator timeouts must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        LeannConfig::default().validate().unwrap();
        LeannConfig::with_dimension(128).validate().unwrap();
    }

    #[test]
    fn zero_anchor_count_is_rejected() {
        let mut c = LeannConfig::with_dimension(128);
        c.anchors.count = 0;
        assert!(matches!(c.validate(), Err(LeannError::Configuration(_))));
    }

    #[test]
    fn indivisible_dimension_is_rejected() {
        let mut c = LeannConfig::with_dimension(100);
        c.quantizer.sub_vectors = 16;
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("divisible"));
    }

    #[test]
    fn oversized_codebook_is_rejected() {
        let mut c = LeannConfig::with_dimension(128);
        c.quantizer.codebook_size = 512;
        assert!(c.validate().is_err());
    }

    #[test]
    fn alpha_below_one_is_rejected() {
        let mut c = LeannConfig::with_dimension(128);
        c.graph = GraphBackend::Vamana(VamanaParams {
            alpha: 0.8,
            ..VamanaParams::default()
        });
        assert!(c.validate().is_err());
    }

    #[test]
    fn parses_tagged_strategies() {
        let json = r#"{
            "dimension": 64,
            "quantizer": { "sub_vectors": 8 },
            "anchors": {
                "count": 12,
                "strategy": {
                    "type": "stratified-k-means",
                    "group_by": "language",
                    "quota": "uniform",
                    "min_per_group": 2
                }
            },
            "graph": { "type": "vamana", "max_degree": 16, "build_beam_width": 32 }
        }"#;
        let c = LeannConfig::from_json_str(json).unwrap();
        assert_eq!(c.dimension, 64);
        assert!(matches!(
            c.anchors.strategy,
            AnchorStrategy::StratifiedKMeans {
                group_by: GroupKey::Language,
                quota: Quota::Uniform,
                min_per_group: 2
            }
        ));
        match c.graph {
            GraphBackend::Vamana(p) => {
                assert_eq!(p.max_degree, 16);
                assert!((p.alpha - 1.2).abs() < 1e-6);
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn snapshot_reparses() {
        let c = LeannConfig::with_dimension(32);
        let mut c = c;
        c.quantizer.sub_vectors = 4;
        let json = c.to_json().unwrap();
        assert_eq!(LeannConfig::from_json_str(&json).unwrap(), c);
    }

    #[test]
    fn malformed_json_is_configuration_error() {
        assert!(matches!(
            LeannConfig::from_json_str("{ not json"),
            Err(LeannError::Configuration(_))
        ));
    }
}
