//! Hot neighborhood cache around the entry point.
//!
//! In disk mode every search starts at the same entry point, so the first
//! hops of every traversal touch the same small neighborhood. Caching that
//! neighborhood (exact vectors + neighbor lists) removes the disk reads from
//! the head of each query. The cache is filled once, deterministically, by a
//! bounded breadth-first walk and is read-only afterwards.

use std::collections::{HashMap, VecDeque};

use crate::bitset::BitSet;
use crate::distance::VectorFetch;
use crate::error::Result;

/// Exact vector and out-neighbors of one cached node.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedNode {
    pub vector: Vec<f32>,
    pub neighbors: Vec<u64>,
}

/// Map of cached nodes plus a bitmap of cached ids.
#[derive(Debug, Clone, PartialEq)]
pub struct HotCache {
    nodes: HashMap<u64, CachedNode>,
    bitmap: BitSet,
}

impl HotCache {
    /// Fill the cache by BFS from `entry`, visiting up to `budget` distinct
    /// ids in level order (neighbor-list order within a level).
    ///
    /// The entry point is always cached, so a `budget` of zero is treated
    /// as one. The result is a connected subgraph containing `entry`.
    pub fn build(
        entry: u64,
        budget: usize,
        edges: &[Vec<u64>],
        fetch: &VectorFetch,
    ) -> Result<Self> {
        let budget = budget.max(1);
        let bitmap = BitSet::new(edges.len());
        let mut nodes = HashMap::with_capacity(budget);
        let mut frontier = VecDeque::new();
        frontier.push_back(entry);

        while let Some(id) = frontier.pop_front() {
            if nodes.len() >= budget {
                break;
            }
            if bitmap.contains_and_add(id) {
                continue;
            }
            let vector = fetch(id)?;
            let neighbors = edges[id as usize].clone();
            for &n in &neighbors {
                frontier.push_back(n);
            }
            nodes.insert(id, CachedNode { vector, neighbors });
        }

        Ok(Self { nodes, bitmap })
    }

    /// Reassemble a cache from persisted parts.
    pub(crate) fn from_parts(nodes: HashMap<u64, CachedNode>, bitmap: BitSet) -> Self {
        Self { nodes, bitmap }
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<&CachedNode> {
        if !self.bitmap.contains(id) {
            return None;
        }
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: u64) -> bool {
        self.bitmap.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn bitmap(&self) -> &BitSet {
        &self.bitmap
    }

    pub(crate) fn nodes(&self) -> &HashMap<u64, CachedNode> {
        &self.nodes
    }
}
