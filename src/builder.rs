//! Vamana graph construction.
//!
//! The build interleaves greedy search with diversity-aware pruning:
//!
//! 1. Random graph initialization (R distinct neighbors per node)
//! 2. Medoid selection as the traversal entry point
//! 3. Two refinement passes over a random permutation: pass 1 at
//!    `alpha = 1.0` stabilizes short edges, pass 2 at the configured
//!    `alpha` adds the long-range edges that make the graph navigable
//!
//! Random initialization, the medoid argmin, and per-shard builds are
//! data-parallel; the refinement pass itself is serialized so that a given
//! seed and corpus always produce the same graph.

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::candidates::CandidateSet;
use crate::config::VamanaConfig;
use crate::distance::{DistanceFn, VectorFetch};
use crate::error::{Result, VamanaError};
use crate::kmeans::KMeans;

/// Per-id stream separation for parallel seeded RNGs.
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

pub(crate) struct Builder {
    pub config: VamanaConfig,
    pub fetch: VectorFetch,
    pub distance: DistanceFn,
}

impl Builder {
    /// Produce the edge list and entry point for the configured corpus.
    pub fn build(&self) -> Result<(Vec<Vec<u64>>, u64)> {
        let n = self.config.vector_count;
        if n == 0 {
            return Err(VamanaError::Empty);
        }
        if self.config.clusters > 1 && n as usize > self.config.clusters {
            self.build_sharded()
        } else {
            self.build_single()
        }
    }

    fn build_single(&self) -> Result<(Vec<Vec<u64>>, u64)> {
        let n = self.config.vector_count;
        info!(
            count = n,
            r = self.config.r,
            l = self.config.l,
            alpha = self.config.alpha,
            "building vamana graph"
        );

        let mut edges = self.random_graph(n);
        let entry = self.medoid(n)?;
        debug!(entry, "selected medoid entry point");

        self.pass(&mut edges, entry, 1.0, self.config.seed ^ 0x0BAD_5EED)?;
        debug!("first refinement pass done");
        self.pass(&mut edges, entry, self.config.alpha, self.config.seed ^ 0xFACE_FEED)?;
        debug!("second refinement pass done");

        Ok((edges, entry))
    }

    /// R distinct uniform neighbors per id, excluding self. Parallel over
    /// ids; each id draws from its own seed-derived stream.
    fn random_graph(&self, count: u64) -> Vec<Vec<u64>> {
        let degree = self.config.r.min(count.saturating_sub(1) as usize);
        let seed = self.config.seed;
        (0..count)
            .into_par_iter()
            .map(|id| {
                let mut rng = StdRng::seed_from_u64(seed ^ id.wrapping_mul(SEED_MIX));
                let mut picked: HashSet<u64> = HashSet::with_capacity(degree);
                while picked.len() < degree {
                    let candidate = rng.random_range(0..count);
                    if candidate != id {
                        picked.insert(candidate);
                    }
                }
                let mut neighbors: Vec<u64> = picked.into_iter().collect();
                neighbors.sort_unstable();
                neighbors
            })
            .collect()
    }

    /// Id whose vector is closest to the component-wise mean. The mean is
    /// accumulated sequentially; the argmin is parallel with a smallest-id
    /// tie-break.
    fn medoid(&self, count: u64) -> Result<u64> {
        let dims = self.config.dimensions;
        let mut mean = vec![0.0f32; dims];
        for id in 0..count {
            let v = (self.fetch)(id)?;
            if v.len() != dims {
                return Err(VamanaError::DimensionMismatch {
                    expected: dims,
                    actual: v.len(),
                });
            }
            for (m, x) in mean.iter_mut().zip(&v) {
                *m += x;
            }
        }
        for m in &mut mean {
            *m /= count as f32;
        }

        let (best, _) = (0..count)
            .into_par_iter()
            .map(|id| {
                let v = (self.fetch)(id)?;
                Ok::<(u64, f32), crate::error::VamanaError>((id, (self.distance)(&v, &mean)))
            })
            .try_reduce(
                || (u64::MAX, f32::INFINITY),
                |a, b| {
                    Ok(if b.1 < a.1 || (b.1 == a.1 && b.0 < a.0) {
                        b
                    } else {
                        a
                    })
                },
            )?;
        Ok(best)
    }

    /// One refinement pass over a seeded random permutation of all ids.
    fn pass(
        &self,
        edges: &mut Vec<Vec<u64>>,
        entry: u64,
        alpha: f32,
        seed: u64,
    ) -> Result<()> {
        let count = edges.len() as u64;
        let mut order: Vec<u64> = (0..count).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut set = CandidateSet::new(
            self.config.l,
            count,
            self.fetch.clone(),
            self.distance.clone(),
        );

        for &x in &order {
            let query = (self.fetch)(x)?;
            let visited = self.greedy_search(&mut set, edges, entry, &query)?;
            self.robust_prune(x, visited, edges, alpha)?;

            let chosen = edges[x as usize].clone();
            for y in chosen {
                if edges[y as usize].contains(&x) {
                    continue;
                }
                if edges[y as usize].len() + 1 > self.config.r {
                    let mut union = edges[y as usize].clone();
                    union.push(x);
                    self.robust_prune(y, union, edges, alpha)?;
                } else {
                    edges[y as usize].push(x);
                }
            }
        }
        Ok(())
    }

    /// Best-first traversal from `entry`; returns every node expanded, in
    /// expansion order.
    fn greedy_search(
        &self,
        set: &mut CandidateSet,
        edges: &[Vec<u64>],
        entry: u64,
        query: &[f32],
    ) -> Result<Vec<u64>> {
        set.re_center(query);
        set.add(entry)?;
        let mut visited = Vec::new();
        while set.not_visited() {
            let node = set.top()?;
            set.add_range(&edges[node as usize])?;
            visited.push(node);
        }
        Ok(visited)
    }

    /// Keep at most R candidates that are mutually diverse: each chosen
    /// neighbor removes every remaining candidate it alpha-dominates.
    fn robust_prune(
        &self,
        p: u64,
        candidates: Vec<u64>,
        edges: &mut [Vec<u64>],
        alpha: f32,
    ) -> Result<()> {
        let p_vec = (self.fetch)(p)?;

        let mut unique = candidates;
        unique.extend_from_slice(&edges[p as usize]);
        unique.sort_unstable();
        unique.dedup();
        unique.retain(|&v| v != p);

        // (id, vector, distance-to-p); distances computed once up front.
        let mut pool = Vec::with_capacity(unique.len());
        for v in unique {
            let vec = (self.fetch)(v)?;
            let d = (self.distance)(&p_vec, &vec);
            pool.push((v, vec, d));
        }

        let mut out: Vec<u64> = Vec::with_capacity(self.config.r);
        while !pool.is_empty() && out.len() < self.config.r {
            let mut best = 0;
            for i in 1..pool.len() {
                let (bid, _, bd) = &pool[best];
                let (cid, _, cd) = &pool[i];
                if cd < bd || (cd == bd && cid < bid) {
                    best = i;
                }
            }
            let (chosen_id, chosen_vec, _) = pool.swap_remove(best);
            out.push(chosen_id);
            if out.len() == self.config.r {
                break;
            }
            pool.retain(|(_, vec, d)| alpha * (self.distance)(&chosen_vec, vec) > *d);
        }

        edges[p as usize] = out;
        Ok(())
    }

    /// Divide-and-conquer build: k-means shards with overlap, independent
    /// Vamana per shard over local ids, union-merged back to global ids.
    fn build_sharded(&self) -> Result<(Vec<Vec<u64>>, u64)> {
        let n = self.config.vector_count;
        let dims = self.config.dimensions;
        info!(
            count = n,
            clusters = self.config.clusters,
            overlap = self.config.cluster_overlap,
            "building sharded vamana graph"
        );

        let mut flat = Vec::with_capacity(n as usize * dims);
        for id in 0..n {
            let v = (self.fetch)(id)?;
            if v.len() != dims {
                return Err(VamanaError::DimensionMismatch {
                    expected: dims,
                    actual: v.len(),
                });
            }
            flat.extend_from_slice(&v);
        }

        let mut km = KMeans::new(dims, self.config.clusters, self.config.seed)?;
        km.fit(&flat, n as usize, &self.distance)?;

        let mut shards: Vec<Vec<u64>> = vec![Vec::new(); self.config.clusters];
        for id in 0..n as usize {
            let row = &flat[id * dims..(id + 1) * dims];
            for c in km.nearest(row, self.config.cluster_overlap, &self.distance) {
                shards[c].push(id as u64);
            }
        }
        drop(flat);

        let shard_graphs: Vec<Option<Vec<Vec<u64>>>> = shards
            .par_iter()
            .enumerate()
            .map(|(shard_idx, shard)| {
                if shard.len() < 2 {
                    return Ok(None);
                }
                let ids = Arc::new(shard.clone());
                let global_fetch = self.fetch.clone();
                let count = ids.len() as u64;
                let local_fetch: VectorFetch = Arc::new(move |local| {
                    let id = *ids
                        .get(local as usize)
                        .ok_or(VamanaError::IdOutOfRange { id: local, count })?;
                    global_fetch(id)
                });
                let sub = Builder {
                    config: VamanaConfig {
                        vector_count: shard.len() as u64,
                        clusters: 1,
                        seed: self.config.seed ^ (shard_idx as u64 + 1),
                        ..self.config.clone()
                    },
                    fetch: local_fetch,
                    distance: self.distance.clone(),
                };
                sub.build_single().map(|(edges, _)| Some(edges))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut edges: Vec<Vec<u64>> = vec![Vec::new(); n as usize];
        for (shard, graph) in shards.iter().zip(&shard_graphs) {
            let Some(graph) = graph else { continue };
            for (local, neighbors) in graph.iter().enumerate() {
                let global_id = shard[local];
                for &local_neighbor in neighbors {
                    let mapped = shard[local_neighbor as usize];
                    let list = &mut edges[global_id as usize];
                    if mapped != global_id && !list.contains(&mapped) {
                        list.push(mapped);
                    }
                }
            }
        }

        // Merged degree over R keeps a uniform random subset of size R.
        for (id, list) in edges.iter_mut().enumerate() {
            if list.len() > self.config.r {
                let mut rng = StdRng::seed_from_u64(
                    self.config.seed ^ (id as u64).wrapping_mul(SEED_MIX),
                );
                list.shuffle(&mut rng);
                list.truncate(self.config.r);
            }
        }

        let entry = self.medoid(n)?;
        self.repair_connectivity(&mut edges, entry)?;
        Ok((edges, entry))
    }

    /// Guarantee that every node keeps an out-edge and can reach `entry`.
    ///
    /// Shards without overlap merge into disconnected islands, and a
    /// singleton shard leaves its members with no edges at all; every node
    /// that cannot reach the entry point gets a direct edge to it.
    fn repair_connectivity(&self, edges: &mut [Vec<u64>], entry: u64) -> Result<()> {
        let n = edges.len();
        let mut incoming: Vec<Vec<u64>> = vec![Vec::new(); n];
        for (id, list) in edges.iter().enumerate() {
            for &next in list {
                incoming[next as usize].push(id as u64);
            }
        }

        let mut can_reach = vec![false; n];
        can_reach[entry as usize] = true;
        let mut frontier = vec![entry];
        while let Some(node) = frontier.pop() {
            for &prev in &incoming[node as usize] {
                if !can_reach[prev as usize] {
                    can_reach[prev as usize] = true;
                    frontier.push(prev);
                }
            }
        }

        let mut repaired = 0usize;
        for (id, list) in edges.iter_mut().enumerate() {
            if can_reach[id] {
                continue;
            }
            if list.len() >= self.config.r {
                list.pop();
            }
            list.push(entry);
            repaired += 1;
        }

        // A degenerate shard can leave the entry point itself bare; point
        // it at its nearest other node.
        if edges[entry as usize].is_empty() && n > 1 {
            let nearest = self.nearest_other(entry, n as u64)?;
            edges[entry as usize].push(nearest);
            repaired += 1;
        }

        if repaired > 0 {
            debug!(repaired, "reconnected stranded nodes to the entry point");
        }
        Ok(())
    }

    /// Closest id to `id` other than itself, smallest id on ties.
    fn nearest_other(&self, id: u64, count: u64) -> Result<u64> {
        let target = (self.fetch)(id)?;
        let (best, _) = (0..count)
            .into_par_iter()
            .filter(|&other| other != id)
            .map(|other| {
                let v = (self.fetch)(other)?;
                Ok::<(u64, f32), crate::error::VamanaError>((other, (self.distance)(&v, &target)))
            })
            .try_reduce(
                || (u64::MAX, f32::INFINITY),
                |a, b| {
                    Ok(if b.1 < a.1 || (b.1 == a.1 && b.0 < a.0) {
                        b
                    } else {
                        a
                    })
                },
            )?;
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{fetch_from_slice, l2_squared_kernel};

    fn grid_corpus(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| vec![(i % 16) as f32, (i / 16) as f32])
            .collect()
    }

    fn builder(corpus: Vec<Vec<f32>>, config: VamanaConfig) -> Builder {
        Builder {
            config,
            fetch: fetch_from_slice(corpus),
            distance: l2_squared_kernel(),
        }
    }

    fn small_config(n: usize) -> VamanaConfig {
        VamanaConfig {
            r: 4,
            l: 8,
            alpha: 1.2,
            vector_count: n as u64,
            dimensions: 2,
            seed: 11,
            ..VamanaConfig::default()
        }
    }

    #[test]
    fn build_respects_degree_bound_and_excludes_self() {
        let n = 64;
        let (edges, entry) = builder(grid_corpus(n), small_config(n)).build().unwrap();
        assert!((entry as usize) < n);
        for (id, list) in edges.iter().enumerate() {
            assert!(list.len() <= 4, "node {} has degree {}", id, list.len());
            assert!(!list.contains(&(id as u64)));
            let mut dedup = list.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), list.len(), "node {} has duplicate edges", id);
        }
    }

    #[test]
    fn every_node_keeps_an_out_edge() {
        let n = 64;
        let (edges, _) = builder(grid_corpus(n), small_config(n)).build().unwrap();
        for (id, list) in edges.iter().enumerate() {
            assert!(!list.is_empty(), "node {} lost all edges", id);
        }
    }

    #[test]
    fn same_seed_reproduces_the_same_graph() {
        let n = 48;
        let (e1, s1) = builder(grid_corpus(n), small_config(n)).build().unwrap();
        let (e2, s2) = builder(grid_corpus(n), small_config(n)).build().unwrap();
        assert_eq!(s1, s2);
        assert_eq!(e1, e2);
    }

    #[test]
    fn medoid_of_a_symmetric_corpus_is_central() {
        // 5 points on a line: the mean is the middle point.
        let corpus: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32]).collect();
        let config = VamanaConfig {
            r: 2,
            l: 4,
            vector_count: 5,
            dimensions: 1,
            ..VamanaConfig::default()
        };
        let b = builder(corpus, config);
        assert_eq!(b.medoid(5).unwrap(), 2);
    }

    #[test]
    fn empty_corpus_fails_to_build() {
        let config = VamanaConfig {
            vector_count: 0,
            dimensions: 2,
            ..VamanaConfig::default()
        };
        let b = builder(Vec::new(), config);
        assert!(matches!(b.build(), Err(VamanaError::Empty)));
    }

    #[test]
    fn sharded_build_matches_invariants() {
        let n = 96;
        let config = VamanaConfig {
            clusters: 4,
            cluster_overlap: 2,
            ..small_config(n)
        };
        let (edges, entry) = builder(grid_corpus(n), config).build().unwrap();
        assert!((entry as usize) < n);
        for (id, list) in edges.iter().enumerate() {
            assert!(list.len() <= 4);
            assert!(!list.contains(&(id as u64)));
        }
    }

    #[test]
    fn sharded_build_without_overlap_leaves_no_stranded_nodes() {
        // Disjoint shards merge into islands until the connectivity repair
        // wires every stranded node back to the entry point.
        let n = 96;
        let config = VamanaConfig {
            clusters: 4,
            cluster_overlap: 1,
            ..small_config(n)
        };
        let (edges, entry) = builder(grid_corpus(n), config).build().unwrap();

        for (id, list) in edges.iter().enumerate() {
            assert!(!list.is_empty(), "node {} has no out-edges", id);
            assert!(list.len() <= 4);
            assert!(!list.contains(&(id as u64)));
        }

        for start in 0..n as u64 {
            let mut seen = std::collections::HashSet::new();
            let mut frontier = vec![start];
            let mut reached = false;
            while let Some(node) = frontier.pop() {
                if node == entry {
                    reached = true;
                    break;
                }
                if !seen.insert(node) {
                    continue;
                }
                frontier.extend(edges[node as usize].iter().copied());
            }
            assert!(reached, "entry unreachable from node {}", start);
        }
    }
}
