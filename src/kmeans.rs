//! Seeded k-means clustering.
//!
//! Shared by product-quantizer codebook training and the sharded build.
//! Uses k-means++ initialization; repeated `fit` calls with the same seed
//! and inputs produce identical centroids.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::DistanceFn;
use crate::error::{Result, VamanaError};

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_EPSILON: f32 = 1e-6;

/// k-means over flat row-major `f32` storage.
pub struct KMeans {
    centroids: Vec<Vec<f32>>,
    dimension: usize,
    k: usize,
    seed: u64,
}

impl KMeans {
    pub fn new(dimension: usize, k: usize, seed: u64) -> Result<Self> {
        if dimension == 0 || k == 0 {
            return Err(VamanaError::InvalidConfig(
                "k-means dimension and k must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            centroids: Vec::new(),
            dimension,
            k,
            seed,
        })
    }

    /// Train on `num_vectors` rows of `vectors`.
    pub fn fit(
        &mut self,
        vectors: &[f32],
        num_vectors: usize,
        distance: &DistanceFn,
    ) -> Result<()> {
        if vectors.len() < num_vectors * self.dimension {
            return Err(VamanaError::InvalidConfig(format!(
                "k-means expected {} values, got {}",
                num_vectors * self.dimension,
                vectors.len()
            )));
        }
        if num_vectors < self.k {
            return Err(VamanaError::InvalidConfig(format!(
                "k-means needs at least k={} vectors, got {}",
                self.k, num_vectors
            )));
        }

        self.centroids = self.init_plus_plus(vectors, num_vectors, distance);

        for _ in 0..MAX_ITERATIONS {
            let assignments = self.assign_all(vectors, num_vectors, distance);
            let new_centroids = self.update_centroids(vectors, num_vectors, &assignments);

            let converged = self
                .centroids
                .iter()
                .zip(new_centroids.iter())
                .all(|(old, new)| distance(old, new) <= CONVERGENCE_EPSILON);

            self.centroids = new_centroids;
            if converged {
                break;
            }
        }

        Ok(())
    }

    /// k-means++: first centroid uniform, the rest weighted by distance to
    /// the nearest centroid chosen so far.
    fn init_plus_plus(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        distance: &DistanceFn,
    ) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(self.k);

        let first = rng.random_range(0..num_vectors);
        centroids.push(self.row(vectors, first).to_vec());

        while centroids.len() < self.k {
            let mut weights = Vec::with_capacity(num_vectors);
            let mut total = 0.0f64;
            for i in 0..num_vectors {
                let row = self.row(vectors, i);
                let nearest = centroids
                    .iter()
                    .map(|c| distance(row, c))
                    .fold(f32::INFINITY, f32::min);
                weights.push(nearest);
                total += nearest as f64;
            }

            if total <= 0.0 {
                // Fewer distinct points than k; reuse an existing point.
                let idx = rng.random_range(0..num_vectors);
                centroids.push(self.row(vectors, idx).to_vec());
                continue;
            }

            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = num_vectors - 1;
            for (i, &w) in weights.iter().enumerate() {
                cumulative += w as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            centroids.push(self.row(vectors, chosen).to_vec());
        }

        centroids
    }

    fn assign_all(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        distance: &DistanceFn,
    ) -> Vec<usize> {
        (0..num_vectors)
            .map(|i| self.assign(self.row(vectors, i), distance))
            .collect()
    }

    /// Index of the nearest centroid.
    #[must_use]
    pub fn assign(&self, vector: &[f32], distance: &DistanceFn) -> usize {
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for (idx, centroid) in self.centroids.iter().enumerate() {
            let d = distance(vector, centroid);
            if d < best_dist {
                best_dist = d;
                best = idx;
            }
        }
        best
    }

    /// Indices of the `m` nearest centroids, ascending by distance with ties
    /// broken by smaller index.
    #[must_use]
    pub fn nearest(&self, vector: &[f32], m: usize, distance: &DistanceFn) -> Vec<usize> {
        let mut scored: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, distance(vector, c)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.into_iter().take(m).map(|(idx, _)| idx).collect()
    }

    fn update_centroids(
        &self,
        vectors: &[f32],
        num_vectors: usize,
        assignments: &[usize],
    ) -> Vec<Vec<f32>> {
        let mut sums = vec![vec![0.0f32; self.dimension]; self.k];
        let mut counts = vec![0usize; self.k];

        for (i, &cluster) in assignments.iter().enumerate().take(num_vectors) {
            counts[cluster] += 1;
            for (j, &val) in self.row(vectors, i).iter().enumerate() {
                sums[cluster][j] += val;
            }
        }

        sums.into_iter()
            .zip(counts)
            .enumerate()
            .map(|(cluster, (sum, count))| {
                if count > 0 {
                    sum.iter().map(|&s| s / count as f32).collect()
                } else {
                    // Empty cluster keeps its previous centroid.
                    self.centroids[cluster].clone()
                }
            })
            .collect()
    }

    fn row<'a>(&self, vectors: &'a [f32], idx: usize) -> &'a [f32] {
        let start = idx * self.dimension;
        &vectors[start..start + self.dimension]
    }

    #[must_use]
    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::l2_squared_kernel;
    use proptest::prelude::*;

    #[test]
    fn separated_blobs_get_separate_centroids() {
        let mut flat = Vec::new();
        for i in 0..20 {
            flat.extend_from_slice(&[i as f32 * 0.01, 0.0]);
        }
        for i in 0..20 {
            flat.extend_from_slice(&[100.0 + i as f32 * 0.01, 0.0]);
        }
        let distance = l2_squared_kernel();
        let mut km = KMeans::new(2, 2, 7).unwrap();
        km.fit(&flat, 40, &distance).unwrap();

        let a = km.assign(&[0.05, 0.0], &distance);
        let b = km.assign(&[100.05, 0.0], &distance);
        assert_ne!(a, b);
    }

    #[test]
    fn nearest_returns_ascending_centroids() {
        let distance = l2_squared_kernel();
        let mut km = KMeans::new(1, 3, 3).unwrap();
        let flat: Vec<f32> = (0..30).map(|i| (i % 3) as f32 * 10.0).collect();
        km.fit(&flat, 30, &distance).unwrap();
        let order = km.nearest(&[0.0], 3, &distance);
        assert_eq!(order.len(), 3);
        let d0 = distance(&[0.0], &km.centroids()[order[0]]);
        let d1 = distance(&[0.0], &km.centroids()[order[1]]);
        assert!(d0 <= d1);
    }

    #[test]
    fn rejects_k_larger_than_corpus() {
        let distance = l2_squared_kernel();
        let mut km = KMeans::new(2, 5, 0).unwrap();
        assert!(km.fit(&[0.0; 8], 4, &distance).is_err());
    }

    proptest! {
        #[test]
        fn fit_is_deterministic_given_seed(
            seed in any::<u64>(),
            dimension in 1usize..8,
            num_vectors in 4usize..32,
            k in 1usize..4,
            raw in proptest::collection::vec(-1.0f32..1.0f32, 8usize..(32 * 8)),
        ) {
            prop_assume!(k <= num_vectors);
            let needed = num_vectors * dimension;
            prop_assume!(raw.len() >= needed);
            let vectors = &raw[..needed];
            let distance = l2_squared_kernel();

            let mut km1 = KMeans::new(dimension, k, seed).unwrap();
            let mut km2 = KMeans::new(dimension, k, seed).unwrap();
            km1.fit(vectors, num_vectors, &distance).unwrap();
            km2.fit(vectors, num_vectors, &distance).unwrap();

            prop_assert_eq!(km1.centroids(), km2.centroids());
        }
    }
}
