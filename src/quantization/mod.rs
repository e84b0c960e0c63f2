//! Residual quantization: compress `item - anchor` with product quantization.
//!
//! ## Why residuals?
//!
//! An item's residual against its nearest anchor is much smaller than the
//! item itself, so the same PQ budget buys a proportionally smaller absolute
//! error. Reconstruction adds the full-precision anchor back:
//!
//! ```text
//! item      x  = [x₁ … x_D]
//! anchor    a  = nearest anchor of x
//! residual  r  = x − a
//!             └─ split into S segments ─┘
//! code         = [c₁ … c_S], cᵢ = argmin_j ‖rᵢ − Cᵢ[j]‖
//! approx    x̂  = a + [C₁[c₁] … C_S[c_S]]
//! ```
//!
//! ## Quality
//!
//! Error is reported as the mean *relative* L2 error `‖x − x̂‖ / ‖x‖` over a
//! validation sample. For unit-norm data `cos(x, x̂) ≥ 1 − error`, which is the
//! bound the query engine relies on for exact-match lookups.
//!
//! If the error misses `max_error` and `retry_larger_codebook` is set, the
//! quantizer is retrained once with twice the centroids (capped at 256). A
//! quantizer that still misses the target is kept but flagged degraded.

pub mod codes;
pub mod pq;

pub use codes::CodeLayout;
pub use pq::{PqFitReport, ProductQuantizer};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::QuantizerConfig;
use crate::distance::{relative_error, row};
use crate::error::{LeannError, Result};
use crate::types::AnchorId;

/// Training outcome recorded in build metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizerReport {
    /// Codebook size actually used (may differ after a retry).
    pub codebook_size: usize,
    /// Mean relative reconstruction error over the validation sample.
    pub mean_error: f32,
    pub retried: bool,
    pub degraded: Option<String>,
}

/// The corpus view the quantizer trains against.
pub struct ResidualSet<'a> {
    /// Row-major item vectors.
    pub vectors: &'a [f32],
    pub anchors: &'a [Vec<f32>],
    /// Owning anchor per row.
    pub assignments: &'a [AnchorId],
    pub dimension: usize,
}

impl ResidualSet<'_> {
    fn len(&self) -> usize {
        self.assignments.len()
    }

    fn residual(&self, i: usize) -> impl Iterator<Item = f32> + '_ {
        let anchor = &self.anchors[self.assignments[i] as usize];
        row(self.vectors, self.dimension, i)
            .iter()
            .zip(anchor.iter())
            .map(|(v, a)| v - a)
    }
}

/// Train a residual quantizer and measure its reconstruction error.
pub fn train_residual_quantizer(
    config: &QuantizerConfig,
    set: &ResidualSet<'_>,
    seed: u64,
    cancel: Option<&CancelToken>,
) -> Result<(ProductQuantizer, QuantizerReport)> {
    let n = set.len();
    if n == 0 {
        return Err(LeannError::build("no items to train the quantizer on"));
    }

    let (training, validation) =
        split_samples(n, config.training_samples, config.validation_samples.max(1), seed);
    let residuals: Vec<f32> = training.iter().flat_map(|&i| set.residual(i)).collect();

    let (mut pq, mut reasons) =
        fit_once(config, config.codebook_size, set, &residuals, training.len(), seed, cancel)?;
    let mut mean_error = validation_error(&pq, set, &validation)?;
    let mut retried = false;

    if mean_error > config.max_error
        && config.retry_larger_codebook
        && config.codebook_size < 256
    {
        let larger = (config.codebook_size * 2).min(256);
        warn!(
            error = mean_error,
            max_error = config.max_error,
            codebook_size = larger,
            "quantization error above target, retraining with larger codebook"
        );
        let (retry_pq, retry_reasons) =
            fit_once(config, larger, set, &residuals, training.len(), seed, cancel)?;
        let retry_error = validation_error(&retry_pq, set, &validation)?;
        retried = true;
        if retry_error <= mean_error {
            pq = retry_pq;
            reasons = retry_reasons;
            mean_error = retry_error;
        }
    }

    if mean_error > config.max_error {
        reasons.push(format!(
            "mean relative error {mean_error:.4} exceeds target {:.4}",
            config.max_error
        ));
    }

    let degraded = (!reasons.is_empty()).then(|| reasons.join("; "));
    if let Some(reason) = &degraded {
        warn!(error = mean_error, "quantizer degraded: {reason}");
    }
    info!(
        codebook_size = pq.codebook_size(),
        error = mean_error,
        training = training.len(),
        validation = validation.len(),
        "residual quantizer trained"
    );

    let report = QuantizerReport {
        codebook_size: pq.codebook_size(),
        mean_error,
        retried,
        degraded,
    };
    Ok((pq, report))
}

fn fit_once(
    config: &QuantizerConfig,
    codebook_size: usize,
    set: &ResidualSet<'_>,
    residuals: &[f32],
    num: usize,
    seed: u64,
    cancel: Option<&CancelToken>,
) -> Result<(ProductQuantizer, Vec<String>)> {
    let mut pq = ProductQuantizer::new(set.dimension, config.sub_vectors, codebook_size)?;
    let fit = pq.fit(residuals, num, config.max_iterations, seed, cancel)?;
    debug!(
        codebook_size,
        unconverged = fit.unconverged_segments,
        degenerate = fit.degenerate_segments,
        "PQ codebooks fitted"
    );

    let mut reasons = Vec::new();
    if num < codebook_size {
        reasons.push(format!(
            "{num} training residuals for {codebook_size} centroids"
        ));
    } else if fit.degenerate_segments > 0 {
        reasons.push(format!(
            "{} of {} segments had too few distinct residuals",
            fit.degenerate_segments, config.sub_vectors
        ));
    }
    Ok((pq, reasons))
}

/// Mean relative reconstruction error over `indices`.
fn validation_error(pq: &ProductQuantizer, set: &ResidualSet<'_>, indices: &[usize]) -> Result<f32> {
    let errors: Vec<f32> = indices
        .par_iter()
        .map(|&i| {
            let v = row(set.vectors, set.dimension, i);
            let anchor = &set.anchors[set.assignments[i] as usize];
            let code = pq.encode_residual(v, anchor)?;
            let approx = pq.reconstruct(anchor, &code)?;
            Ok(relative_error(v, &approx))
        })
        .collect::<Result<_>>()?;
    Ok(errors.iter().sum::<f32>() / errors.len().max(1) as f32)
}

/// Disjoint, sorted, seeded training and validation samples from `0..n`.
///
/// Validation items come from outside the training sample. When the training
/// limit covers every item, a tenth of them is held out instead. A single
/// item is both.
pub(crate) fn split_samples(
    n: usize,
    training_limit: usize,
    validation_limit: usize,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let held_out = if n > training_limit {
        n - training_limit
    } else if n > 1 {
        (n / 10).max(1)
    } else {
        0
    };
    let mut training = order[..(n - held_out).min(training_limit)].to_vec();
    let mut validation = order[n - validation_limit.min(held_out)..].to_vec();
    if validation.is_empty() {
        validation = training.clone();
    }
    training.sort_unstable();
    validation.sort_unstable();
    (training, validation)
}

/// Sorted, seeded sample of up to `limit` indices from `0..n`.
pub(crate) fn sample_indices(n: usize, limit: usize, seed: u64) -> Vec<usize> {
    if limit >= n {
        return (0..n).collect();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut idx = rand::seq::index::sample(&mut rng, n, limit).into_vec();
    idx.sort_unstable();
    idx
}
