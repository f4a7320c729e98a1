//! vamana: disk-friendly approximate nearest neighbor search.
//!
//! An implementation of the Vamana graph construction behind DiskANN: a
//! flat, alpha-pruned proximity graph whose greedy traversal from a fixed
//! entry point returns top-k neighbors at sub-linear cost.
//!
//! # Why a Flat Graph?
//!
//! Unlike HNSW's hierarchy, Vamana uses a single layer because:
//! - Hierarchy adds random I/O (jumping between layers)
//! - One fixed-width record per node makes a disk lookup a single read
//! - Alpha-pruning provides the long-range edges layers would otherwise add
//!
//! # Residency Modes
//!
//! ```text
//! Memory:  [edge lists in RAM] + [exact vectors via the fetch callback]
//! Disk:    [hot cache around the entry point] + [PQ codes in RAM]
//!              ↓ cache miss
//! SSD:     [node 0: neighbors + vector][node 1: neighbors + vector]...
//! ```
//!
//! The in-memory form scores every candidate exactly. The disk-resident
//! form scores candidates from product-quantized codes, re-sorting with the
//! exact vector carried back by each row read, and can expand `beam_size`
//! frontier entries per step with parallel row fetches.
//!
//! # Parameters
//!
//! | Parameter | Typical | Effect |
//! |-----------|---------|--------|
//! | `r` | 16-64 | Max edges per node. Higher = better recall, more I/O |
//! | `l` | 32-256 | Search list size. Higher = better recall, slower search |
//! | `alpha` | 1.2-1.4 | Pruning relaxation. Higher = denser long-range edges |
//! | `beam_size` | 1-8 | Parallel row fetches per step in disk mode |
//!
//! # Usage
//!
//! ```no_run
//! use vamana::{l2_squared_kernel, fetch_from_slice, VamanaConfig, VamanaIndex};
//!
//! let corpus: Vec<Vec<f32>> = vec![vec![0.0; 128]; 1000];
//! let config = VamanaConfig {
//!     vector_count: corpus.len() as u64,
//!     dimensions: 128,
//!     ..VamanaConfig::default()
//! };
//!
//! let mut index = VamanaIndex::build(
//!     config,
//!     fetch_from_slice(corpus),
//!     l2_squared_kernel(),
//! ).unwrap();
//!
//! let neighbors = index.search_by_vector(&vec![0.1; 128], 10).unwrap();
//!
//! // Optional: move the graph to disk with 8-segment PQ codes.
//! index.switch_to_disk("graph.rows".as_ref(), 8, 256).unwrap();
//! index.set_beam_size(4);
//! let neighbors = index.search_by_vector(&vec![0.1; 128], 10).unwrap();
//! # let _ = neighbors;
//! ```
//!
//! # References
//!
//! - Jayaram Subramanya et al. (2019). "DiskANN: Fast Accurate Billion-point
//!   Nearest Neighbor Search on a Single Node."

pub mod bitset;
pub mod cache;
pub mod candidates;
pub mod config;
pub mod distance;
pub mod error;
pub mod graph;
pub mod kmeans;
pub mod persist;
pub mod pq;

mod builder;
mod index;

pub use config::VamanaConfig;
pub use distance::{
    cosine_distance, dot, fetch_from_slice, l2, l2_squared, l2_squared_kernel, normalize,
    DistanceFn, VectorFetch,
};
pub use error::{Result, VamanaError};
pub use index::{SearchStats, VamanaIndex};
