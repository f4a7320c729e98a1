//! Product quantization: per-subspace codebooks and asymmetric distance.
//!
//! A vector of dimension `D` is split into `segments` contiguous subvectors;
//! each subvector is replaced by the index of its nearest codeword in a
//! per-segment codebook learned with k-means. A code is therefore
//! `segments` bytes, a 32-128x compression of a float vector.
//!
//! Distance to a code is *asymmetric*: the query stays exact, and the
//! per-segment query-to-codeword distances are precomputed once per query
//! into an ADC table, after which scoring one code is `segments` table
//! lookups and adds.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::distance::{DistanceFn, VectorFetch};
use crate::error::{Result, VamanaError};
use crate::kmeans::KMeans;

/// Product quantizer: `segments` codebooks of `centroids` codewords each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dimensions: usize,
    segments: usize,
    centroids: usize,
    segment_dim: usize,
    /// `[segment][codeword][segment_dim]`, empty until trained.
    codebooks: Vec<Vec<Vec<f32>>>,
}

impl ProductQuantizer {
    pub fn new(dimensions: usize, segments: usize, centroids: usize) -> Result<Self> {
        if dimensions == 0 || segments == 0 || centroids == 0 {
            return Err(VamanaError::InvalidConfig(
                "quantizer parameters must be greater than 0".to_string(),
            ));
        }
        if dimensions % segments != 0 {
            return Err(VamanaError::InvalidConfig(format!(
                "dimensions {} not divisible by {} segments",
                dimensions, segments
            )));
        }
        if centroids > 256 {
            return Err(VamanaError::InvalidConfig(format!(
                "centroids per segment capped at 256 (one byte per code), got {}",
                centroids
            )));
        }
        Ok(Self {
            dimensions,
            segments,
            centroids,
            segment_dim: dimensions / segments,
            codebooks: Vec::new(),
        })
    }

    /// Fit one codebook per segment over the whole corpus.
    ///
    /// Codebooks are trained independently, in parallel, each with a seed
    /// derived from `seed` and the segment index.
    pub fn fit(
        &mut self,
        fetch: &VectorFetch,
        count: u64,
        distance: &DistanceFn,
        seed: u64,
    ) -> Result<()> {
        let mut subvectors: Vec<Vec<f32>> = (0..self.segments)
            .map(|_| Vec::with_capacity(count as usize * self.segment_dim))
            .collect();
        for id in 0..count {
            let v = fetch(id)?;
            if v.len() != self.dimensions {
                return Err(VamanaError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: v.len(),
                });
            }
            for (s, chunk) in v.chunks_exact(self.segment_dim).enumerate() {
                subvectors[s].extend_from_slice(chunk);
            }
        }

        self.codebooks = subvectors
            .par_iter()
            .enumerate()
            .map(|(s, flat)| {
                let mut km =
                    KMeans::new(self.segment_dim, self.centroids, seed ^ (s as u64 + 1))?;
                km.fit(flat, count as usize, distance)?;
                Ok(km.centroids().to_vec())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    #[must_use]
    pub fn is_trained(&self) -> bool {
        !self.codebooks.is_empty()
    }

    /// Encode a vector as one codeword index per segment.
    pub fn encode(&self, vector: &[f32], distance: &DistanceFn) -> Result<Vec<u8>> {
        if vector.len() != self.dimensions {
            return Err(VamanaError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        let mut code = Vec::with_capacity(self.segments);
        for (s, chunk) in vector.chunks_exact(self.segment_dim).enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for (idx, codeword) in self.codebooks[s].iter().enumerate() {
                let d = distance(chunk, codeword);
                if d < best_dist {
                    best_dist = d;
                    best = idx;
                }
            }
            code.push(best as u8);
        }
        Ok(code)
    }

    /// Precompute the query-to-codeword distance table, laid out
    /// `[segment * centroids + codeword]`.
    pub fn adc_table(&self, query: &[f32], distance: &DistanceFn) -> Result<Vec<f32>> {
        if query.len() != self.dimensions {
            return Err(VamanaError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        let mut table = Vec::with_capacity(self.segments * self.centroids);
        for (s, chunk) in query.chunks_exact(self.segment_dim).enumerate() {
            for codeword in &self.codebooks[s] {
                table.push(distance(chunk, codeword));
            }
        }
        Ok(table)
    }

    /// Score a code against a precomputed ADC table: lookups and adds only.
    #[inline]
    #[must_use]
    pub fn distance_with_table(&self, table: &[f32], code: &[u8]) -> f32 {
        code.iter()
            .enumerate()
            .map(|(s, &c)| table[s * self.centroids + c as usize])
            .sum()
    }

    /// Query-to-code distance without a reusable table.
    pub fn asymmetric_distance(
        &self,
        query: &[f32],
        code: &[u8],
        distance: &DistanceFn,
    ) -> Result<f32> {
        let table = self.adc_table(query, distance)?;
        Ok(self.distance_with_table(&table, code))
    }

    #[must_use]
    pub fn segments(&self) -> usize {
        self.segments
    }

    #[must_use]
    pub fn centroids(&self) -> usize {
        self.centroids
    }

    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub(crate) fn codebooks(&self) -> &[Vec<Vec<f32>>] {
        &self.codebooks
    }

    pub(crate) fn set_codebooks(&mut self, codebooks: Vec<Vec<Vec<f32>>>) -> Result<()> {
        if codebooks.len() != self.segments
            || codebooks
                .iter()
                .any(|cb| cb.len() != self.centroids || cb.iter().any(|c| c.len() != self.segment_dim))
        {
            return Err(VamanaError::CorruptIndex(
                "codebook shape disagrees with quantizer layout".to_string(),
            ));
        }
        self.codebooks = codebooks;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{fetch_from_slice, l2_squared_kernel};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_corpus(n: usize, d: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..d).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn rejects_indivisible_dimensions() {
        assert!(ProductQuantizer::new(10, 3, 16).is_err());
        assert!(ProductQuantizer::new(10, 2, 300).is_err());
        assert!(ProductQuantizer::new(12, 4, 16).is_ok());
    }

    #[test]
    fn code_length_equals_segments() {
        let corpus = random_corpus(64, 8, 1);
        let distance = l2_squared_kernel();
        let fetch = fetch_from_slice(corpus.clone());
        let mut pq = ProductQuantizer::new(8, 4, 16).unwrap();
        pq.fit(&fetch, 64, &distance, 9).unwrap();
        let code = pq.encode(&corpus[0], &distance).unwrap();
        assert_eq!(code.len(), 4);
    }

    #[test]
    fn table_scoring_matches_direct_scoring() {
        let corpus = random_corpus(64, 8, 2);
        let distance = l2_squared_kernel();
        let fetch = fetch_from_slice(corpus.clone());
        let mut pq = ProductQuantizer::new(8, 2, 8).unwrap();
        pq.fit(&fetch, 64, &distance, 5).unwrap();

        let query = vec![0.1f32; 8];
        let table = pq.adc_table(&query, &distance).unwrap();
        for v in corpus.iter().take(8) {
            let code = pq.encode(v, &distance).unwrap();
            let via_table = pq.distance_with_table(&table, &code);
            let direct = pq.asymmetric_distance(&query, &code, &distance).unwrap();
            assert!((via_table - direct).abs() < 1e-6);
        }
    }

    #[test]
    fn approximate_distance_tracks_exact_distance() {
        // With as many centroids as distinct subvectors, quantization is
        // near-lossless and the asymmetric distance approaches the exact one.
        let corpus = random_corpus(32, 4, 3);
        let distance = l2_squared_kernel();
        let fetch = fetch_from_slice(corpus.clone());
        let mut pq = ProductQuantizer::new(4, 2, 32).unwrap();
        pq.fit(&fetch, 32, &distance, 11).unwrap();

        let query = vec![0.0f32; 4];
        let mut exact: Vec<(usize, f32)> = corpus
            .iter()
            .enumerate()
            .map(|(i, v)| (i, distance(&query, v)))
            .collect();
        exact.sort_by(|a, b| a.1.total_cmp(&b.1));

        let table = pq.adc_table(&query, &distance).unwrap();
        let mut approx: Vec<(usize, f32)> = corpus
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let code = pq.encode(v, &distance).unwrap();
                (i, pq.distance_with_table(&table, &code))
            })
            .collect();
        approx.sort_by(|a, b| a.1.total_cmp(&b.1));

        // Nearest exact neighbor should appear near the head of the
        // approximate ranking.
        let top_exact = exact[0].0;
        let rank = approx.iter().position(|&(i, _)| i == top_exact).unwrap();
        assert!(rank < 5, "exact top-1 ranked {} under PQ", rank);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let corpus = random_corpus(16, 8, 4);
        let distance = l2_squared_kernel();
        let fetch = fetch_from_slice(corpus);
        let mut pq = ProductQuantizer::new(8, 4, 8).unwrap();
        pq.fit(&fetch, 16, &distance, 1).unwrap();
        assert!(pq.encode(&[0.0; 7], &distance).is_err());
        assert!(pq.adc_table(&[0.0; 9], &distance).is_err());
    }
}
