//! Index health: validation metrics, tiered status, rebuild advice.
//!
//! | Metric | Meaning | Threshold |
//! |--------|---------|-----------|
//! | coverage | sampled items whose own anchor is among the anchors a query searches | `min_coverage` |
//! | quantization_error | mean relative PQ error from the build | `max_quantization_error` |
//! | utilization_balance | `1 / (1 + cv)` of anchor member counts | `min_balance` |
//! | connectivity | anchors reachable from the graph entry point | `min_connectivity` |
//! | delta_ratio | pending segment items / main items | `max_delta_ratio`, `delta_index_threshold` |
//!
//! Problems are advisory: they land in [`HealthReport::issues`] and never
//! surface as errors. Only an index that cannot be loaded at all is
//! [`HealthStatus::CorruptOrMissing`].

use std::fmt;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorClass, Result};
use crate::index::IndexGeneration;
use crate::persistence::GenerationStore;
use crate::quantization::sample_indices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    CorruptOrMissing,
}

/// One failed check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "kebab-case")]
pub enum HealthIssue {
    LowCoverage {
        coverage: f32,
        minimum: f32,
    },
    HighQuantizationError {
        error: f32,
        maximum: f32,
    },
    Imbalanced {
        balance: f32,
        minimum: f32,
    },
    Disconnected {
        connectivity: f32,
        minimum: f32,
        orphans: usize,
    },
    DeltaGrowth {
        segment_items: usize,
        ratio: f32,
        threshold: usize,
        max_ratio: f32,
    },
    /// A fallback recorded at build time.
    DegradedBuild {
        reason: String,
    },
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssue::LowCoverage { coverage, minimum } => {
                write!(f, "coverage {coverage:.3} below {minimum:.3}")
            }
            HealthIssue::HighQuantizationError { error, maximum } => {
                write!(f, "quantization error {error:.3} above {maximum:.3}")
            }
            HealthIssue::Imbalanced { balance, minimum } => {
                write!(f, "anchor utilization balance {balance:.3} below {minimum:.3}")
            }
            HealthIssue::Disconnected {
                connectivity,
                minimum,
                orphans,
            } => write!(
                f,
                "graph connectivity {connectivity:.3} below {minimum:.3} ({orphans} unreachable anchors)"
            ),
            HealthIssue::DeltaGrowth {
                segment_items,
                ratio,
                threshold,
                max_ratio,
            } => write!(
                f,
                "delta segment holds {segment_items} items (ratio {ratio:.3}); limits are {threshold} items / ratio {max_ratio:.3}"
            ),
            HealthIssue::DegradedBuild { reason } => write!(f, "degraded build: {reason}"),
        }
    }
}

impl HealthIssue {
    /// A configured quality minimum that a rebuild retrains against.
    pub fn breaches_minimum(&self) -> bool {
        matches!(
            self,
            HealthIssue::LowCoverage { .. }
                | HealthIssue::HighQuantizationError { .. }
                | HealthIssue::Imbalanced { .. }
                | HealthIssue::Disconnected { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generation: u64,
    pub coverage: f32,
    pub quantization_error: f32,
    pub utilization_balance: f32,
    pub connectivity: f32,
    pub delta_ratio: f32,
    /// Mean of the per-metric scores, in `[0, 1]`.
    pub health_score: f32,
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    pub recommend_rebuild: bool,
}

impl HealthReport {
    /// Measure `generation` against its own configured thresholds.
    pub fn assess(generation: &IndexGeneration) -> Result<Self> {
        let config = generation.config();
        let thresholds = &config.health;
        let update = &config.update;
        let mut issues = Vec::new();

        let coverage = sampled_coverage(generation)?;
        if coverage < thresholds.min_coverage {
            issues.push(HealthIssue::LowCoverage {
                coverage,
                minimum: thresholds.min_coverage,
            });
        }

        let quantization_error = generation.metadata().quantizer.mean_error;
        if quantization_error > thresholds.max_quantization_error {
            issues.push(HealthIssue::HighQuantizationError {
                error: quantization_error,
                maximum: thresholds.max_quantization_error,
            });
        }

        let utilization_balance = balance(&member_counts(generation));
        if utilization_balance < thresholds.min_balance {
            issues.push(HealthIssue::Imbalanced {
                balance: utilization_balance,
                minimum: thresholds.min_balance,
            });
        }

        let reachability = generation.graph().connectivity()?;
        let connectivity = reachability.ratio;
        if connectivity < thresholds.min_connectivity {
            issues.push(HealthIssue::Disconnected {
                connectivity,
                minimum: thresholds.min_connectivity,
                orphans: reachability.orphans.len(),
            });
        }

        let growth = generation.growth();
        let delta_exceeded = growth.exceeds(update);
        if delta_exceeded {
            issues.push(HealthIssue::DeltaGrowth {
                segment_items: growth.segment_items,
                ratio: growth.ratio,
                threshold: update.delta_index_threshold,
                max_ratio: update.max_delta_ratio,
            });
        }

        for reason in &generation.metadata().degraded {
            issues.push(HealthIssue::DegradedBuild {
                reason: reason.clone(),
            });
        }

        let delta_score = if update.max_delta_ratio > 0.0 {
            1.0 - (growth.ratio / update.max_delta_ratio).min(1.0)
        } else {
            1.0
        };
        let scores = [
            coverage,
            1.0 - quantization_error.clamp(0.0, 1.0),
            utilization_balance,
            connectivity,
            delta_score,
        ];
        let health_score = scores.iter().sum::<f32>() / scores.len() as f32;

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else if health_score < thresholds.unhealthy_below {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        let mut report = Self {
            generation: generation.version(),
            coverage,
            quantization_error,
            utilization_balance,
            connectivity,
            delta_ratio: growth.ratio,
            health_score,
            status,
            issues,
            recommend_rebuild: false,
        };
        report.recommend_rebuild =
            delta_exceeded || (update.rebuild_on_unhealthy && report.below_minimums());
        if report.status == HealthStatus::Healthy {
            info!(version = report.generation, score = health_score, "index healthy");
        } else {
            warn!(
                version = report.generation,
                score = health_score,
                status = ?report.status,
                issues = report.issues.len(),
                recommend_rebuild = report.recommend_rebuild,
                "index health degraded"
            );
        }
        Ok(report)
    }

    /// Issues that call for a health-driven rebuild.
    pub fn breached_minimums(&self) -> Vec<HealthIssue> {
        self.issues
            .iter()
            .filter(|i| i.breaches_minimum())
            .cloned()
            .collect()
    }

    /// Unhealthy overall, or at least one quality minimum missed.
    pub fn below_minimums(&self) -> bool {
        self.status == HealthStatus::Unhealthy
            || self.issues.iter().any(HealthIssue::breaches_minimum)
    }
}

/// Fraction of sampled items whose anchor the query path would search.
fn sampled_coverage(generation: &IndexGeneration) -> Result<f32> {
    let records = generation.store().records();
    if records.is_empty() {
        return Ok(1.0);
    }
    let config = generation.config();
    let searched = config
        .query
        .candidate_multiplier
        .saturating_mul(config.query.top_k)
        .max(config.query.min_candidate_anchors);
    let ef = config.graph.default_ef().max(searched);
    let sample = sample_indices(records.len(), config.health.coverage_samples.max(1), config.seed);

    let hits = sample
        .par_iter()
        .map(|&i| -> Result<usize> {
            let record = &records[i];
            let approx = generation.reconstruct(record)?;
            let found = generation.search_anchors(&approx, searched, ef)?;
            Ok(usize::from(found.iter().any(|&(a, _)| a == record.anchor_id)))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sum::<usize>();
    Ok(hits as f32 / sample.len() as f32)
}

fn member_counts(generation: &IndexGeneration) -> Vec<usize> {
    let mut counts = vec![0usize; generation.anchors().len()];
    let view = generation.segment().view();
    for record in generation.store().records() {
        if !view.touches(record.item_id) {
            counts[record.anchor_id as usize] += 1;
        }
    }
    for record in view.live_records() {
        if let Some(c) = counts.get_mut(record.anchor_id as usize) {
            *c += 1;
        }
    }
    counts
}

/// `1 / (1 + coefficient of variation)`; 1.0 for perfectly even counts.
fn balance(counts: &[usize]) -> f32 {
    if counts.is_empty() {
        return 1.0;
    }
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<usize>() as f64 / n;
    if mean == 0.0 {
        return 1.0;
    }
    let var = counts
        .iter()
        .map(|&c| (c as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (1.0 / (1.0 + var.sqrt() / mean)) as f32
}

/// Result of validating a persisted index, mapped to a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Healthy,
    Degraded,
    Unhealthy,
    CorruptOrMissing,
    /// Validation itself failed for a reason that may pass on retry.
    Transient,
}

impl ValidationOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ValidationOutcome::Healthy => 0,
            ValidationOutcome::Degraded => 10,
            ValidationOutcome::Unhealthy => 20,
            ValidationOutcome::CorruptOrMissing => 30,
            ValidationOutcome::Transient => 40,
        }
    }
}

impl From<HealthStatus> for ValidationOutcome {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => ValidationOutcome::Healthy,
            HealthStatus::Degraded => ValidationOutcome::Degraded,
            HealthStatus::Unhealthy => ValidationOutcome::Unhealthy,
            HealthStatus::CorruptOrMissing => ValidationOutcome::CorruptOrMissing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub outcome: ValidationOutcome,
    pub report: Option<HealthReport>,
    pub error: Option<String>,
}

impl ValidationReport {
    fn failed(outcome: ValidationOutcome, error: String) -> Self {
        Self {
            outcome,
            report: None,
            error: Some(error),
        }
    }
}

/// Load the active generation under `root` and assess it.
pub fn validate_store(root: &Path) -> ValidationReport {
    let store = match GenerationStore::open_existing(root) {
        Ok(store) => store,
        Err(e) => return ValidationReport::failed(ValidationOutcome::CorruptOrMissing, e.to_string()),
    };
    let generation = match store.load_active() {
        Ok(g) => g,
        Err(e) => {
            let outcome = match e.class() {
                ErrorClass::Structural | ErrorClass::Invalid => ValidationOutcome::CorruptOrMissing,
                ErrorClass::Transient | ErrorClass::Fatal => ValidationOutcome::Transient,
            };
            warn!(root = %root.display(), error = %e, ?outcome, "index validation failed");
            return ValidationReport::failed(outcome, e.to_string());
        }
    };
    match HealthReport::assess(&generation) {
        Ok(report) => ValidationReport {
            outcome: report.status.into(),
            report: Some(report),
            error: None,
        },
        Err(e) => {
            let outcome = if e.class() == ErrorClass::Structural {
                ValidationOutcome::CorruptOrMissing
            } else {
                ValidationOutcome::Transient
            };
            ValidationReport::failed(outcome, e.to_string())
        }
    }
}
