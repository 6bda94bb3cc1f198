//! Distance metric implementations for HNSW search.
//!
//! Supports three distance functions: cosine, euclidean (L2), and dot product.
//! The public free functions validate their inputs and return [`VectorError`]
//! on mismatched lengths; the graph itself calls the unchecked kernels through
//! [`DistanceMetric::distance`] since every stored vector was validated on insert.

use crate::error::VectorError;
use serde::{Deserialize, Serialize};

/// Distance metric used for vector similarity computation.
///
/// All metrics return a distance value where **lower is better** (more similar).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine distance: `1 - cosine_similarity`. Range: \[0, 2\].
    #[default]
    Cosine,
    /// Euclidean distance (L2). Range: \[0, ∞).
    Euclidean,
    /// Negative dot product: `-dot(a, b)`. Lower = higher similarity.
    DotProduct,
}

impl DistanceMetric {
    /// Unchecked distance between two equal-length vectors.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - cosine_kernel(a, b),
            DistanceMetric::Euclidean => euclidean_sq_kernel(a, b).sqrt(),
            DistanceMetric::DotProduct => -dot_kernel(a, b),
        }
    }

    /// Convert a distance into a caller-facing score where higher is better.
    ///
    /// Cosine reports similarity, dot product reports the raw dot product and
    /// euclidean maps into (0, 1] via `1 / (1 + d)`.
    #[inline]
    pub fn score(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance),
            DistanceMetric::DotProduct => -distance,
        }
    }
}

fn check_lengths(a: &[f32], b: &[f32]) -> Result<(), VectorError> {
    if a.len() != b.len() {
        return Err(VectorError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Validate a vector against an expected dimensionality.
pub fn validate_vector(vector: &[f32], dimensions: usize) -> Result<(), VectorError> {
    if vector.is_empty() {
        return Err(VectorError::Empty);
    }
    if vector.len() != dimensions {
        return Err(VectorError::DimensionMismatch {
            expected: dimensions,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(VectorError::NonFinite);
    }
    Ok(())
}

/// Cosine similarity `dot(a, b) / (‖a‖·‖b‖)`. Zero vectors give 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    check_lengths(a, b)?;
    Ok(cosine_kernel(a, b))
}

/// `1 - cosine_similarity(a, b)`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    Ok(1.0 - cosine_similarity(a, b)?)
}

/// Euclidean (L2) distance.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    check_lengths(a, b)?;
    Ok(euclidean_sq_kernel(a, b).sqrt())
}

/// Dot product `Σ aᵢ·bᵢ`.
pub fn dot_product(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    check_lengths(a, b)?;
    Ok(dot_kernel(a, b))
}

/// Returns a unit-length copy of `v`. A zero vector normalizes to a zero vector.
pub fn normalize(v: &[f32]) -> Result<Vec<f32>, VectorError> {
    if v.iter().any(|x| !x.is_finite()) {
        return Err(VectorError::NonFinite);
    }
    let norm = dot_kernel(v, v).sqrt();
    if norm < 1e-10 {
        return Ok(vec![0.0; v.len()]);
    }
    Ok(v.iter().map(|x| x / norm).collect())
}

// Scalar kernels. Kept scalar so results are bit-identical across targets.

fn cosine_kernel(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    dot / denom
}

fn euclidean_sq_kernel(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

fn dot_kernel(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cosine_orthogonal_and_identical() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).unwrap().abs() < 1e-6);
        assert!((cosine_distance(&a, &a).unwrap()).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero_not_nan() {
        let z = [0.0, 0.0, 0.0];
        let s = cosine_similarity(&z, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(s, 0.0);
    }

    #[test]
    fn test_euclidean_345() {
        let d = euclidean_distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap(), 32.0);
    }

    #[test]
    fn test_mismatched_lengths_fail() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        let expected = VectorError::DimensionMismatch {
            expected: 2,
            actual: 3,
        };
        assert_eq!(cosine_similarity(&a, &b), Err(expected.clone()));
        assert_eq!(cosine_distance(&a, &b), Err(expected.clone()));
        assert_eq!(euclidean_distance(&a, &b), Err(expected.clone()));
        assert_eq!(dot_product(&a, &b), Err(expected));
    }

    #[test]
    fn test_normalize_zero_vector() {
        let n = normalize(&[0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(n, vec![0.0; 4]);
        assert!(n.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_normalize_does_not_mutate() {
        let v = vec![3.0, 4.0];
        let n = normalize(&v).unwrap();
        assert_eq!(v, vec![3.0, 4.0]);
        assert!((n[0] - 0.6).abs() < 1e-6 && (n[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_metric_score_is_higher_better() {
        assert!((DistanceMetric::Cosine.score(0.0) - 1.0).abs() < 1e-6);
        assert!((DistanceMetric::Euclidean.score(0.0) - 1.0).abs() < 1e-6);
        assert!(DistanceMetric::Euclidean.score(1.0) < DistanceMetric::Euclidean.score(0.5));
        let d = DistanceMetric::DotProduct.distance(&[1.0, 2.0], &[3.0, 4.0]);
        assert_eq!(DistanceMetric::DotProduct.score(d), 11.0);
    }

    #[test]
    fn test_validate_vector() {
        assert!(validate_vector(&[1.0, 2.0], 2).is_ok());
        assert_eq!(validate_vector(&[], 2), Err(VectorError::Empty));
        assert_eq!(validate_vector(&[f32::NAN, 1.0], 2), Err(VectorError::NonFinite));
        assert!(matches!(
            validate_vector(&[1.0], 2),
            Err(VectorError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_metric_serde_names() {
        let json = serde_json::to_string(&DistanceMetric::DotProduct).unwrap();
        assert_eq!(json, "\"dot_product\"");
    }

    fn nonzero_vec(dim: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-100.0f32..100.0, dim)
            .prop_filter("non-zero", |v| v.iter().any(|x| x.abs() > 1e-3))
    }

    proptest! {
        #[test]
        fn test_prop_self_similarity(v in (1usize..64).prop_flat_map(nonzero_vec)) {
            let s = cosine_similarity(&v, &v).unwrap();
            prop_assert!((s - 1.0).abs() < 1e-4, "similarity {}", s);
            prop_assert!(cosine_distance(&v, &v).unwrap().abs() < 1e-4);
        }

        #[test]
        fn test_prop_mismatch_always_errors(
            a in prop::collection::vec(-1.0f32..1.0, 1..32),
            extra in 1usize..8,
        ) {
            let mut b = a.clone();
            b.extend(std::iter::repeat(0.5).take(extra));
            prop_assert!(cosine_similarity(&a, &b).is_err());
            prop_assert!(cosine_distance(&a, &b).is_err());
            prop_assert!(euclidean_distance(&a, &b).is_err());
            prop_assert!(dot_product(&a, &b).is_err());
        }

        #[test]
        fn test_prop_normalize_unit_length(v in (1usize..64).prop_flat_map(nonzero_vec)) {
            let n = normalize(&v).unwrap();
            let len: f32 = n.iter().map(|x| x * x).sum::<f32>().sqrt();
            prop_assert!((len - 1.0).abs() < 1e-3);
        }

        #[test]
        fn test_prop_euclidean_symmetric(
            (a, b) in (1usize..32).prop_flat_map(|d| (
                prop::collection::vec(-10.0f32..10.0, d),
                prop::collection::vec(-10.0f32..10.0, d),
            ))
        ) {
            let ab = euclidean_distance(&a, &b).unwrap();
            let ba = euclidean_distance(&b, &a).unwrap();
            prop_assert!((ab - ba).abs() < 1e-4);
            prop_assert!(ab >= 0.0);
        }
    }
}
