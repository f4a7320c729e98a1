//! The Vamana index: build, search, disk switch, tunables.
//!
//! An index is built once per corpus snapshot and is read-only afterwards,
//! except for [`switch_to_disk`](VamanaIndex::switch_to_disk) (which trades
//! the in-RAM edge list for a fixed-width graph file, PQ codes and a hot
//! cache) and the tunable setters. Searches share the index by reference;
//! each search owns its candidate set, so concurrent queries never contend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::builder::Builder;
use crate::cache::HotCache;
use crate::candidates::{CandidateSet, PqScorer};
use crate::config::VamanaConfig;
use crate::distance::{DistanceFn, VectorFetch};
use crate::error::{Result, VamanaError};
use crate::graph::{write_disk_graph, DiskGraph, GraphStore, NeighborList};
use crate::persist;
use crate::pq::ProductQuantizer;

/// Counters observed during one search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    /// Beam steps taken before the frontier was exhausted.
    pub hops: usize,
}

/// How each traversal step expands the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeamStrategy {
    /// Expand one frontier entry per step.
    Single,
    /// First step of a beam search: expand one entry to seed the frontier,
    /// then switch to `BeamWarm`.
    BeamInit,
    /// Expand the best `beam_size` entries per step with parallel row
    /// fetches.
    BeamWarm,
}

/// Disk-friendly approximate-nearest-neighbor index over a Vamana graph.
pub struct VamanaIndex {
    pub(crate) config: VamanaConfig,
    pub(crate) entry_point: u64,
    pub(crate) graph: GraphStore,
    pub(crate) graph_path: Option<PathBuf>,
    pub(crate) cache: Option<HotCache>,
    pub(crate) pq: Option<Arc<ProductQuantizer>>,
    pub(crate) codes: Option<Arc<Vec<Vec<u8>>>>,
    pub(crate) fetch: VectorFetch,
    pub(crate) distance: DistanceFn,
    pub(crate) on_disk: bool,
}

impl std::fmt::Debug for VamanaIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VamanaIndex")
            .field("config", &self.config)
            .field("entry_point", &self.entry_point)
            .field("graph_path", &self.graph_path)
            .field("on_disk", &self.on_disk)
            .finish_non_exhaustive()
    }
}

impl VamanaIndex {
    /// Build an in-memory index over the configured corpus snapshot.
    ///
    /// May take minutes for large N. Vector-fetch failures abort the build.
    pub fn build(
        config: VamanaConfig,
        fetch: VectorFetch,
        distance: DistanceFn,
    ) -> Result<Self> {
        config.validate()?;
        if config.vector_count == 0 {
            return Err(VamanaError::Empty);
        }
        let builder = Builder {
            config: config.clone(),
            fetch: fetch.clone(),
            distance: distance.clone(),
        };
        let (edges, entry_point) = builder.build()?;
        Ok(Self {
            config,
            entry_point,
            graph: GraphStore::Memory(edges),
            graph_path: None,
            cache: None,
            pq: None,
            codes: None,
            fetch,
            distance,
            on_disk: false,
        })
    }

    /// Convert a built in-memory index to its disk-resident form.
    ///
    /// Writes the fixed-width graph file to `path`, fills the hot cache
    /// around the entry point, trains a `(segments, centroids)` product
    /// quantizer and encodes every uncached vector, then drops the in-RAM
    /// edge list in favor of the mapped file.
    pub fn switch_to_disk(
        &mut self,
        path: &Path,
        segments: usize,
        centroids: usize,
    ) -> Result<()> {
        let GraphStore::Memory(edges) = &self.graph else {
            return Err(VamanaError::InvalidConfig(
                "index is already disk-resident".to_string(),
            ));
        };
        info!(
            path = %path.display(),
            segments,
            centroids,
            cache = self.config.cache_size,
            "switching index to disk"
        );

        write_disk_graph(
            path,
            edges,
            self.config.r,
            self.config.dimensions,
            &self.fetch,
        )?;
        let cache = HotCache::build(
            self.entry_point,
            self.config.cache_size,
            edges,
            &self.fetch,
        )?;
        debug!(cached = cache.len(), "hot cache filled");

        let mut pq = ProductQuantizer::new(self.config.dimensions, segments, centroids)?;
        pq.fit(
            &self.fetch,
            self.config.vector_count,
            &self.distance,
            self.config.seed,
        )?;
        let pq = Arc::new(pq);

        // Cached ids keep their exact vectors in RAM and get an empty code.
        let codes: Vec<Vec<u8>> = (0..self.config.vector_count)
            .into_par_iter()
            .map(|id| {
                if cache.contains(id) {
                    return Ok(Vec::new());
                }
                let v = (self.fetch)(id)?;
                pq.encode(&v, &self.distance)
            })
            .collect::<Result<_>>()?;

        let disk = DiskGraph::open(
            path,
            self.config.vector_count,
            self.config.r,
            self.config.dimensions,
        )?;
        self.graph = GraphStore::Disk(disk);
        self.graph_path = Some(path.to_path_buf());
        self.cache = Some(cache);
        self.pq = Some(pq);
        self.codes = Some(Arc::new(codes));
        self.on_disk = true;
        Ok(())
    }

    /// Top-`k` nearest stored ids for `query`, nearest first.
    pub fn search_by_vector(&self, query: &[f32], k: usize) -> Result<Vec<u64>> {
        self.search_inner(query, k, None).map(|(ids, _)| ids)
    }

    /// Like [`search_by_vector`](Self::search_by_vector), observing `cancel`
    /// between beam steps; a cancelled search returns no partial results.
    pub fn search_by_vector_with_cancel(
        &self,
        query: &[f32],
        k: usize,
        cancel: &AtomicBool,
    ) -> Result<Vec<u64>> {
        self.search_inner(query, k, Some(cancel)).map(|(ids, _)| ids)
    }

    /// Search and report traversal counters alongside the results.
    pub fn search_by_vector_with_stats(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<(Vec<u64>, SearchStats)> {
        self.search_inner(query, k, None)
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        cancel: Option<&AtomicBool>,
    ) -> Result<(Vec<u64>, SearchStats)> {
        if self.config.vector_count == 0 {
            return Err(VamanaError::Empty);
        }
        if query.len() != self.config.dimensions {
            return Err(VamanaError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: query.len(),
            });
        }

        // The candidate capacity is the configured search list, raised to k
        // when the caller asks for more results than it would hold.
        let mut set = CandidateSet::new(
            self.config.l.max(k),
            self.config.vector_count,
            self.fetch.clone(),
            self.distance.clone(),
        );
        set.re_center(query);

        if self.on_disk {
            set.set_pq(PqScorer {
                quantizer: self.require_pq()?.clone(),
                codes: self.require_codes()?.clone(),
            });
            set.add_pq(self.entry_point, self.require_cache()?)?;
        } else {
            set.add(self.entry_point)?;
        }

        let mut strategy = if self.on_disk && self.config.beam_size > 1 {
            BeamStrategy::BeamInit
        } else {
            BeamStrategy::Single
        };

        let mut stats = SearchStats::default();
        while set.not_visited() {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(VamanaError::Cancelled);
                }
            }
            self.beam_step(&mut set, &mut strategy)?;
            stats.hops += 1;
        }

        Ok((set.elements(k), stats))
    }

    fn beam_step(&self, set: &mut CandidateSet, strategy: &mut BeamStrategy) -> Result<()> {
        match *strategy {
            BeamStrategy::Single | BeamStrategy::BeamInit => {
                let top = set.top()?;
                let (neighbors, vector) = self.graph.neighbors(top, self.cache.as_ref())?;
                if let Some(v) = &vector {
                    set.re_sort(top, v);
                }
                self.admit(set, &neighbors)?;
                if *strategy == BeamStrategy::BeamInit {
                    *strategy = BeamStrategy::BeamWarm;
                }
            }
            BeamStrategy::BeamWarm => {
                let tops = set.top_n(self.config.beam_size);
                let rows: Vec<(u64, (NeighborList, Option<Vec<f32>>))> = tops
                    .par_iter()
                    .map(|&id| {
                        self.graph
                            .neighbors(id, self.cache.as_ref())
                            .map(|row| (id, row))
                    })
                    .collect::<Result<_>>()?;
                for (id, (neighbors, vector)) in rows {
                    if let Some(v) = &vector {
                        set.re_sort(id, v);
                    }
                    self.admit(set, &neighbors)?;
                }
            }
        }
        Ok(())
    }

    fn admit(&self, set: &mut CandidateSet, neighbors: &[u64]) -> Result<()> {
        if self.on_disk {
            set.add_range_pq(neighbors, self.require_cache()?)
        } else {
            set.add_range(neighbors)
        }
    }

    fn require_cache(&self) -> Result<&HotCache> {
        self.cache
            .as_ref()
            .ok_or_else(|| VamanaError::CorruptIndex("hot cache missing".to_string()))
    }

    fn require_pq(&self) -> Result<&Arc<ProductQuantizer>> {
        self.pq
            .as_ref()
            .ok_or_else(|| VamanaError::CorruptIndex("product quantizer missing".to_string()))
    }

    fn require_codes(&self) -> Result<&Arc<Vec<Vec<u8>>>> {
        self.codes
            .as_ref()
            .ok_or_else(|| VamanaError::CorruptIndex("PQ codes missing".to_string()))
    }

    /// Persist the index as a self-contained directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        persist::save(self, dir)
    }

    /// Reopen a persisted index; the fetch and distance callbacks are never
    /// serialized and must be supplied again.
    pub fn open(dir: &Path, fetch: VectorFetch, distance: DistanceFn) -> Result<Self> {
        persist::open(dir, fetch, distance)
    }

    /// Hot-cache node budget, applied the next time the cache is built
    /// (at [`switch_to_disk`](Self::switch_to_disk)).
    pub fn set_cache_size(&mut self, cache_size: usize) {
        self.config.cache_size = cache_size;
    }

    /// Beam width, applied from the next search on.
    pub fn set_beam_size(&mut self, beam_size: usize) {
        self.config.beam_size = beam_size.max(1);
    }

    /// Search-list capacity, applied from the next search on.
    pub fn set_l(&mut self, l: usize) {
        self.config.l = l.max(1);
    }

    #[must_use]
    pub fn config(&self) -> &VamanaConfig {
        &self.config
    }

    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    #[must_use]
    pub fn is_on_disk(&self) -> bool {
        self.on_disk
    }

    /// The edge list, available while the index is memory-resident.
    #[must_use]
    pub fn graph(&self) -> Option<&[Vec<u64>]> {
        match &self.graph {
            GraphStore::Memory(edges) => Some(edges),
            GraphStore::Disk(_) => None,
        }
    }
}
