//! Distance metrics and injected capabilities.
//!
//! The index never owns a metric: both the distance kernel and the
//! vector-by-id fetch are supplied by the caller as shared closures and
//! re-supplied on [`open`](crate::VamanaIndex::open); neither is serialized.
//!
//! ## Important nuance
//!
//! Graph construction and search only ever *compare* distances, so the
//! cheaper [`l2_squared`] is the usual choice over [`l2`]. Both rank
//! identically.

use std::sync::Arc;

use crate::error::Result;

/// Distance kernel over two equal-length vectors.
///
/// Must be non-negative and symmetric. Thread-safe: one kernel is shared by
/// all build workers and concurrent searches.
pub type DistanceFn = Arc<dyn Fn(&[f32], &[f32]) -> f32 + Send + Sync>;

/// Vector fetch callback: id to vector.
///
/// Pure and deterministic; fetch failures during build are fatal to the
/// build.
pub type VectorFetch = Arc<dyn Fn(u64) -> Result<Vec<f32>> + Send + Sync>;

/// Squared L2 (Euclidean) distance.
///
/// If dimensions mismatch, this returns `f32::INFINITY` (so it is never
/// selected as a nearest neighbor).
#[inline]
#[must_use]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// L2 (Euclidean) distance.
#[inline]
#[must_use]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    l2_squared(a, b).sqrt()
}

/// Dot product.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine distance $1 - \cos(a,b)$.
///
/// Computes norms when needed, so it does **not** require pre-normalized
/// vectors.
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    let na = dot(a, a).sqrt();
    let nb = dot(b, b).sqrt();
    if na < 1e-10 || nb < 1e-10 {
        return 1.0;
    }
    1.0 - (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

/// Normalize a vector to unit L2 norm.
#[inline]
#[must_use]
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = dot(v, v).sqrt();
    if n < 1e-10 {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / n).collect()
}

/// Squared-L2 kernel wrapped as an injectable [`DistanceFn`].
#[must_use]
pub fn l2_squared_kernel() -> DistanceFn {
    Arc::new(l2_squared)
}

/// Fetch closure over an owned in-memory corpus, for callers whose vectors
/// already live in RAM.
#[must_use]
pub fn fetch_from_slice(corpus: Vec<Vec<f32>>) -> VectorFetch {
    let corpus = Arc::new(corpus);
    Arc::new(move |id| {
        corpus
            .get(id as usize)
            .cloned()
            .ok_or(crate::VamanaError::IdOutOfRange {
                id,
                count: corpus.len() as u64,
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_squared_self_is_zero() {
        let a = [1.0_f32, 2.0, 3.0];
        assert!(l2_squared(&a, &a).abs() < 1e-10);
    }

    #[test]
    fn l2_squared_known_value() {
        let a = [0.0_f32, 0.0];
        let b = [3.0_f32, 4.0];
        assert!((l2_squared(&a, &b) - 25.0).abs() < 1e-6);
        assert!((l2(&a, &b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_are_infinitely_far() {
        let a = [1.0_f32, 2.0];
        let b = [1.0_f32, 2.0, 3.0];
        assert!(l2_squared(&a, &b).is_infinite());
    }

    #[test]
    fn cosine_distance_is_zero_for_identical() {
        let a = [1.0_f32, 2.0, 3.0];
        assert!(cosine_distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn fetch_from_slice_bounds() {
        let fetch = fetch_from_slice(vec![vec![1.0, 2.0]]);
        assert_eq!(fetch(0).unwrap(), vec![1.0, 2.0]);
        assert!(fetch(1).is_err());
    }
}
