//! Product Quantization (PQ) of anchor residuals.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::codes::CodeLayout;
use crate::cancel::CancelToken;
use crate::distance::{l2_squared, row};
use crate::error::{LeannError, Result};
use crate::partitioning::KMeans;

/// Product Quantizer.
///
/// Decomposes vectors into subvectors and quantizes each subvector independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dimension: usize,
    num_codebooks: usize,
    codebook_size: usize,
    subvector_dim: usize,
    codebooks: Vec<Vec<Vec<f32>>>, // [codebook][codeword][dimension]
    layout: CodeLayout,
}

/// Per-fit diagnostics.
#[derive(Debug, Clone, Default)]
pub struct PqFitReport {
    /// Segments whose k-means hit the iteration cap.
    pub unconverged_segments: usize,
    /// Segments with fewer distinct residuals than centroids.
    pub degenerate_segments: usize,
}

impl ProductQuantizer {
    /// Create new product quantizer.
    pub fn new(dimension: usize, num_codebooks: usize, codebook_size: usize) -> Result<Self> {
        if dimension == 0 || num_codebooks == 0 || codebook_size == 0 {
            return Err(LeannError::config("all PQ parameters must be greater than 0"));
        }

        if dimension % num_codebooks != 0 {
            return Err(LeannError::config(format!(
                "dimension {dimension} must be divisible by {num_codebooks} sub-vectors"
            )));
        }

        Ok(Self {
            dimension,
            num_codebooks,
            codebook_size,
            subvector_dim: dimension / num_codebooks,
            codebooks: Vec::new(),
            layout: CodeLayout::new(num_codebooks, codebook_size)?,
        })
    }

    /// Train one codebook per segment, segments in parallel.
    pub fn fit(
        &mut self,
        vectors: &[f32],
        num_vectors: usize,
        max_iterations: usize,
        seed: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<PqFitReport> {
        if num_vectors == 0 {
            return Err(LeannError::build("no residuals to train PQ codebooks on"));
        }

        let results: Vec<Result<(Vec<Vec<f32>>, bool, bool)>> = (0..self.num_codebooks)
            .into_par_iter()
            .map(|codebook_idx| {
                let start_dim = codebook_idx * self.subvector_dim;
                let end_dim = start_dim + self.subvector_dim;

                // Flatten subvectors for k-means
                let mut flat = Vec::with_capacity(num_vectors * self.subvector_dim);
                for i in 0..num_vectors {
                    flat.extend_from_slice(&row(vectors, self.dimension, i)[start_dim..end_dim]);
                }

                let mut kmeans = KMeans::new(self.subvector_dim, self.codebook_size)?
                    .with_seed(seed.wrapping_add(codebook_idx as u64))
                    .with_max_iterations(max_iterations)
                    .with_tolerance(1e-5);
                let report = kmeans.fit(&flat, num_vectors, cancel)?;
                Ok((kmeans.into_centroids(), report.converged, report.degenerate))
            })
            .collect();

        let mut report = PqFitReport::default();
        let mut codebooks = Vec::with_capacity(self.num_codebooks);
        for result in results {
            let (centroids, converged, degenerate) = result?;
            if !converged {
                report.unconverged_segments += 1;
            }
            if degenerate {
                report.degenerate_segments += 1;
            }
            codebooks.push(centroids);
        }
        self.codebooks = codebooks;
        Ok(report)
    }

    /// Nearest-centroid index per segment.
    pub fn quantize(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = Vec::with_capacity(self.num_codebooks);

        for codebook_idx in 0..self.num_codebooks {
            let start_dim = codebook_idx * self.subvector_dim;
            let end_dim = (codebook_idx + 1) * self.subvector_dim;
            let subvector = &vector[start_dim..end_dim];

            // Find closest codeword
            let mut best_code = 0u8;
            let mut best_dist = f32::INFINITY;

            for (code, codeword) in self.codebooks[codebook_idx].iter().enumerate() {
                let dist = l2_squared(subvector, codeword);
                if dist < best_dist {
                    best_dist = dist;
                    best_code = code.min(255) as u8;
                }
            }

            codes.push(best_code);
        }

        codes
    }

    /// Quantize and bit-pack a residual.
    pub fn encode(&self, residual: &[f32]) -> Result<Vec<u8>> {
        self.ensure_trained()?;
        if residual.len() != self.dimension {
            return Err(LeannError::DimensionMismatch {
                expected: self.dimension,
                actual: residual.len(),
            });
        }
        self.layout.pack(&self.quantize(residual))
    }

    /// Encode `vector - anchor`.
    pub fn encode_residual(&self, vector: &[f32], anchor: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != anchor.len() {
            return Err(LeannError::DimensionMismatch {
                expected: anchor.len(),
                actual: vector.len(),
            });
        }
        let residual: Vec<f32> = vector.iter().zip(anchor).map(|(v, a)| v - a).collect();
        self.encode(&residual)
    }

    /// Approximate residual for a packed code.
    pub fn decode(&self, code: &[u8]) -> Result<Vec<f32>> {
        let mut out = vec![0.0; self.dimension];
        self.add_decoded(code, &mut out)?;
        Ok(out)
    }

    /// Approximate embedding: `anchor + decode(code)`.
    pub fn reconstruct(&self, anchor: &[f32], code: &[u8]) -> Result<Vec<f32>> {
        if anchor.len() != self.dimension {
            return Err(LeannError::DimensionMismatch {
                expected: self.dimension,
                actual: anchor.len(),
            });
        }
        let mut out = anchor.to_vec();
        self.add_decoded(code, &mut out)?;
        Ok(out)
    }

    /// Add the decoded residual of `code` onto `out` in place.
    fn add_decoded(&self, code: &[u8], out: &mut [f32]) -> Result<()> {
        self.ensure_trained()?;
        let indices = self.layout.unpack(code)?;
        for (codebook_idx, &idx) in indices.iter().enumerate() {
            let codeword = &self.codebooks[codebook_idx][usize::from(idx)];
            let start = codebook_idx * self.subvector_dim;
            for (o, c) in out[start..start + self.subvector_dim].iter_mut().zip(codeword) {
                *o += c;
            }
        }
        Ok(())
    }

    fn ensure_trained(&self) -> Result<()> {
        if self.codebooks.len() != self.num_codebooks {
            return Err(LeannError::build("product quantizer used before training"));
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    pub fn layout(&self) -> CodeLayout {
        self.layout
    }

    /// Get codebooks (for testing/debugging).
    pub fn codebooks(&self) -> &[Vec<Vec<f32>>] {
        &self.codebooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    #[test]
    fn decode_before_fit_is_an_error() {
        let pq = ProductQuantizer::new(8, 2, 16).unwrap();
        assert!(pq.decode(&[0]).is_err());
    }

    #[test]
    fn reconstruction_beats_zero_baseline() {
        let (n, dim) = (400, 16);
        let data = random_vectors(n, dim, 11);
        let mut pq = ProductQuantizer::new(dim, 4, 32).unwrap();
        pq.fit(&data, n, 20, 5, None).unwrap();

        let mut err = 0.0;
        let mut base = 0.0;
        for i in 0..n {
            let v = row(&data, dim, i);
            let code = pq.encode(v).unwrap();
            assert_eq!(code.len(), pq.layout().code_len());
            let approx = pq.decode(&code).unwrap();
            err += l2_squared(v, &approx);
            base += l2_squared(v, &vec![0.0; dim]);
        }
        assert!(err < base * 0.6, "err {err} base {base}");
    }

    #[test]
    fn reconstruct_adds_anchor_back() {
        let dim = 4;
        let data = vec![0.5f32; dim * 4];
        let mut pq = ProductQuantizer::new(dim, 2, 2).unwrap();
        pq.fit(&data, 4, 5, 1, None).unwrap();
        let anchor = vec![1.0f32; dim];
        let code = pq.encode(&data[..dim]).unwrap();
        let approx = pq.reconstruct(&anchor, &code).unwrap();
        for x in approx {
            assert!((x - 1.5).abs() < 1e-5);
        }
    }

    #[test]
    fn malformed_code_is_rejected() {
        let dim = 8;
        let data = random_vectors(64, dim, 3);
        let mut pq = ProductQuantizer::new(dim, 2, 16).unwrap();
        pq.fit(&data, 64, 5, 1, None).unwrap();
        assert!(pq.decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn indivisible_dimension_is_rejected() {
        assert!(ProductQuantizer::new(10, 3, 16).is_err());
    }
}
