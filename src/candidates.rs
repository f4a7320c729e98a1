//! Bounded best-first candidate set keyed by distance to the current query.
//!
//! One candidate set is owned exclusively by one search (or one build
//! iteration); it is re-bound to a new query with [`CandidateSet::re_center`].
//! Ids that were ever inserted (including ids evicted past capacity) are
//! remembered in a bit set and never re-admitted, which is what guarantees
//! the traversal loop terminates.

use std::sync::Arc;

use crate::bitset::BitSet;
use crate::cache::HotCache;
use crate::distance::{DistanceFn, VectorFetch};
use crate::error::{Result, VamanaError};
use crate::pq::ProductQuantizer;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: u64,
    distance: f32,
    visited: bool,
    /// Whether `distance` was computed from the exact vector rather than a
    /// PQ code.
    exact: bool,
}

/// PQ scoring state shared with the index: trained quantizer plus the
/// per-id codes (empty code = id lives in the hot cache).
#[derive(Clone)]
pub(crate) struct PqScorer {
    pub quantizer: Arc<ProductQuantizer>,
    pub codes: Arc<Vec<Vec<u8>>>,
}

/// Fixed-capacity frontier ordered by ascending `(distance, id)`.
pub struct CandidateSet {
    capacity: usize,
    query: Vec<f32>,
    entries: Vec<Candidate>,
    seen: BitSet,
    fetch: VectorFetch,
    distance: DistanceFn,
    pq: Option<PqScorer>,
    /// Per-query ADC table, built lazily on the first PQ-scored insert.
    adc: Option<Vec<f32>>,
}

impl CandidateSet {
    /// A set holding at most `capacity` candidates over ids `[0, universe)`.
    pub fn new(
        capacity: usize,
        universe: u64,
        fetch: VectorFetch,
        distance: DistanceFn,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            query: Vec::new(),
            entries: Vec::with_capacity(capacity + 1),
            seen: BitSet::new(universe as usize),
            fetch,
            distance,
            pq: None,
            adc: None,
        }
    }

    pub(crate) fn set_pq(&mut self, scorer: PqScorer) {
        self.pq = Some(scorer);
        self.adc = None;
    }

    /// Clear the set and bind it to a new query; all cached distances and
    /// the seen set from prior queries are invalidated.
    pub fn re_center(&mut self, query: &[f32]) {
        self.entries.clear();
        self.seen.clear();
        self.adc = None;
        self.query.clear();
        self.query.extend_from_slice(query);
    }

    fn check_id(&self, id: u64) -> Result<()> {
        if id as usize >= self.seen.len() {
            return Err(VamanaError::IdOutOfRange {
                id,
                count: self.seen.len() as u64,
            });
        }
        Ok(())
    }

    /// Sorted-position insert with eviction of the farthest element past
    /// capacity; equal distances keep the smaller id.
    fn insert(&mut self, cand: Candidate) {
        if self.seen.contains_and_add(cand.id) {
            return;
        }
        let pos = self.entries.partition_point(|e| {
            e.distance
                .total_cmp(&cand.distance)
                .then(e.id.cmp(&cand.id))
                .is_lt()
        });
        if pos >= self.capacity {
            // Worse than the current worst of a full set; stays seen.
            if self.entries.len() >= self.capacity {
                return;
            }
        }
        self.entries.insert(pos, cand);
        if self.entries.len() > self.capacity {
            self.entries.pop();
        }
    }

    /// Insert `id` scored with its exact vector.
    pub fn add(&mut self, id: u64) -> Result<()> {
        self.check_id(id)?;
        if self.seen.contains(id) {
            return Ok(());
        }
        let vector = (self.fetch)(id)?;
        let distance = (self.distance)(&self.query, &vector);
        self.insert(Candidate {
            id,
            distance,
            visited: false,
            exact: true,
        });
        Ok(())
    }

    /// Insert `id` scored from the hot cache when present, else from its PQ
    /// code; the stored distance is marked exact only for cache hits.
    pub fn add_pq(&mut self, id: u64, cache: &HotCache) -> Result<()> {
        self.check_id(id)?;
        if self.seen.contains(id) {
            return Ok(());
        }
        if let Some(node) = cache.get(id) {
            let distance = (self.distance)(&self.query, &node.vector);
            self.insert(Candidate {
                id,
                distance,
                visited: false,
                exact: true,
            });
            return Ok(());
        }
        let scorer = match &self.pq {
            Some(s) => s.clone(),
            None => return self.add(id),
        };
        let code = &scorer.codes[id as usize];
        if code.is_empty() {
            // Marked cached at encode time but absent from this cache; score
            // it exactly instead of trusting a stale code.
            return self.add(id);
        }
        if self.adc.is_none() {
            self.adc = Some(scorer.quantizer.adc_table(&self.query, &self.distance)?);
        }
        let table = self.adc.as_ref().unwrap();
        let distance = scorer.quantizer.distance_with_table(table, code);
        self.insert(Candidate {
            id,
            distance,
            visited: false,
            exact: false,
        });
        Ok(())
    }

    /// Batch [`CandidateSet::add`].
    pub fn add_range(&mut self, ids: &[u64]) -> Result<()> {
        for &id in ids {
            self.add(id)?;
        }
        Ok(())
    }

    /// Batch [`CandidateSet::add_pq`].
    pub fn add_range_pq(&mut self, ids: &[u64], cache: &HotCache) -> Result<()> {
        for &id in ids {
            self.add_pq(id, cache)?;
        }
        Ok(())
    }

    /// Smallest-distance unvisited element, marked visited.
    pub fn top(&mut self) -> Result<u64> {
        match self.entries.iter_mut().find(|e| !e.visited) {
            Some(e) => {
                e.visited = true;
                Ok(e.id)
            }
            None => Err(VamanaError::Empty),
        }
    }

    /// Up to `n` smallest-distance unvisited elements in ascending order,
    /// all marked visited.
    pub fn top_n(&mut self, n: usize) -> Vec<u64> {
        let mut out = Vec::with_capacity(n);
        for e in self.entries.iter_mut().filter(|e| !e.visited).take(n) {
            e.visited = true;
            out.push(e.id);
        }
        out
    }

    /// Re-score a previously inserted element with its exact vector and
    /// reinsert it at the position its true distance earns. Elements whose
    /// stored distance is already exact are left untouched.
    pub fn re_sort(&mut self, id: u64, vector: &[f32]) {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return;
        };
        if self.entries[pos].exact {
            return;
        }
        let old = self.entries.remove(pos);
        let distance = (self.distance)(&self.query, vector);
        let cand = Candidate {
            id,
            distance,
            visited: old.visited,
            exact: true,
        };
        let at = self.entries.partition_point(|e| {
            e.distance
                .total_cmp(&cand.distance)
                .then(e.id.cmp(&cand.id))
                .is_lt()
        });
        self.entries.insert(at, cand);
    }

    /// The `k` smallest-distance ids, visited or not.
    #[must_use]
    pub fn elements(&self, k: usize) -> Vec<u64> {
        self.entries.iter().take(k).map(|e| e.id).collect()
    }

    /// True iff any element has not been expanded yet.
    #[must_use]
    pub fn not_visited(&self) -> bool {
        self.entries.iter().any(|e| !e.visited)
    }

    /// Current number of resident candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no candidates are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
