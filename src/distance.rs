//! Distance metrics for dense vectors.
//!
//! Graph traversal and anchor assignment work with a *distance* (lower is
//! closer); the query engine reports a *similarity* (higher is better). Both
//! are derived from the same [`Metric`] so that the anchor an item is assigned
//! to is also the anchor a query for that item reaches first.
//!
//! ## Important nuance
//!
//! [`Metric::Cosine`] computes norms on every call. Anchors are k-means
//! centroids and are therefore *not* unit length even when the corpus is, so
//! the `1 - dot` shortcut is never valid here.

use serde::{Deserialize, Serialize};

const NORM_EPSILON: f32 = 1e-9;

/// Similarity space of the embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    /// Cosine similarity; distance is $1 - \cos(a,b)$.
    #[default]
    Cosine,
    /// Raw dot product; distance is $-\langle a,b\rangle$.
    InnerProduct,
    /// Euclidean; similarity is the negated distance.
    L2,
}

impl Metric {
    /// Distance between two vectors (lower is closer).
    ///
    /// If dimensions mismatch, this returns `f32::INFINITY` so the pair is never
    /// selected as a nearest neighbor.
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self {
            Metric::Cosine => 1.0 - cosine(a, b).clamp(-1.0, 1.0),
            Metric::InnerProduct => -dot(a, b),
            Metric::L2 => l2_squared(a, b).sqrt(),
        }
    }

    /// Similarity score reported to callers (higher is better).
    #[inline]
    #[must_use]
    pub fn similarity(self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::NEG_INFINITY;
        }
        match self {
            Metric::Cosine => cosine(a, b).clamp(-1.0, 1.0),
            Metric::InnerProduct => dot(a, b),
            Metric::L2 => -l2_squared(a, b).sqrt(),
        }
    }
}

/// Dot product.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity; zero if either vector is (near) zero.
#[inline]
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let d = dot(a, b);
    let na = norm(a);
    let nb = norm(b);
    if na > NORM_EPSILON && nb > NORM_EPSILON {
        d / (na * nb)
    } else {
        0.0
    }
}

/// Squared Euclidean distance. Used by k-means and codebook assignment.
#[inline]
#[must_use]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Normalize a vector to unit L2 norm.
#[inline]
#[must_use]
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = norm(v);
    if n < 1e-10 {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / n).collect()
}

/// Relative reconstruction error $\lVert x - \hat x\rVert / \lVert x\rVert$.
///
/// Falls back to the absolute error for (near) zero originals.
#[inline]
#[must_use]
pub fn relative_error(original: &[f32], approx: &[f32]) -> f32 {
    let err = l2_squared(original, approx).sqrt();
    let n = norm(original);
    if n > NORM_EPSILON {
        err / n
    } else {
        err
    }
}

/// Row `idx` of a flat row-major matrix with `dimension` columns.
#[inline]
pub(crate) fn row(vectors: &[f32], dimension: usize, idx: usize) -> &[f32] {
    let start = idx * dimension;
    &vectors[start..start + dimension]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_distance_is_zero_for_identical() {
        let a = [1.0_f32, 2.0, 3.0];
        assert!(Metric::Cosine.distance(&a, &a).abs() < 1e-6);
        assert!((Metric::Cosine.similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_ignores_scale() {
        let a = [3.0_f32, 4.0];
        let b = [6.0_f32, 8.0];
        assert!(Metric::Cosine.distance(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn inner_product_orders_by_dot() {
        let q = [1.0_f32, 0.0];
        let near = [2.0_f32, 0.0];
        let far = [0.5_f32, 0.0];
        assert!(Metric::InnerProduct.distance(&q, &near) < Metric::InnerProduct.distance(&q, &far));
    }

    #[test]
    fn l2_matches_pythagoras() {
        let a = [0.0_f32, 0.0];
        let b = [3.0_f32, 4.0];
        assert!((Metric::L2.distance(&a, &b) - 5.0).abs() < 1e-6);
        assert!((l2_squared(&a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_dimensions_never_win() {
        assert_eq!(Metric::Cosine.distance(&[1.0], &[1.0, 0.0]), f32::INFINITY);
        assert_eq!(
            Metric::InnerProduct.similarity(&[1.0], &[1.0, 0.0]),
            f32::NEG_INFINITY
        );
    }

    #[test]
    fn relative_error_of_exact_copy_is_zero() {
        let v = normalize(&[0.2, -0.4, 0.9]);
        assert!(relative_error(&v, &v) < 1e-7);
    }
}
