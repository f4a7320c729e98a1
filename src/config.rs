//! Index configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VamanaError};

/// Configuration for a [`VamanaIndex`](crate::VamanaIndex).
///
/// | Field | Typical | Effect |
/// |-------|---------|--------|
/// | `r` | 16-64 | Max out-degree. Higher = better recall, more I/O per hop |
/// | `l` | 32-256 | Candidate-set capacity. Higher = better recall, slower search |
/// | `alpha` | 1.2-1.4 | Prune relaxation. Larger = denser long-range edges |
/// | `beam_size` | 1-8 | Frontier entries expanded per step in disk mode |
/// | `cache_size` | ~1% of N | Hot-neighborhood nodes kept in RAM in disk mode |
///
/// `clusters > 1` enables the sharded build: the corpus is k-means
/// partitioned, each point joins its `cluster_overlap` nearest shards, and
/// the per-shard graphs are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VamanaConfig {
    /// Maximum out-degree per node (R in the paper).
    pub r: usize,
    /// Search list / candidate-set capacity (L in the paper).
    pub l: usize,
    /// Prune relaxation factor, >= 1.0.
    pub alpha: f32,
    /// Number of vectors in the corpus snapshot.
    pub vector_count: u64,
    /// Vector dimensionality shared by the whole index.
    pub dimensions: usize,
    /// Hot-cache budget in nodes, used when the index goes to disk.
    pub cache_size: usize,
    /// Frontier entries expanded per beam step (1 = sequential).
    pub beam_size: usize,
    /// Shard count for the sharded build; 1 disables sharding.
    pub clusters: usize,
    /// Each point is assigned to its `cluster_overlap` nearest shards.
    pub cluster_overlap: usize,
    /// Seed for every randomized build step; same seed + same corpus gives
    /// an identical graph.
    pub seed: u64,
}

impl Default for VamanaConfig {
    fn default() -> Self {
        Self {
            r: 32,
            l: 64,
            alpha: 1.2,
            vector_count: 0,
            dimensions: 0,
            cache_size: 256,
            beam_size: 1,
            clusters: 1,
            cluster_overlap: 1,
            seed: 0,
        }
    }
}

impl VamanaConfig {
    /// Reject parameter combinations that would build a broken index.
    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(VamanaError::InvalidConfig("r must be >= 1".to_string()));
        }
        if self.l == 0 {
            return Err(VamanaError::InvalidConfig("l must be >= 1".to_string()));
        }
        if !(self.alpha >= 1.0) {
            return Err(VamanaError::InvalidConfig(format!(
                "alpha must be >= 1.0, got {}",
                self.alpha
            )));
        }
        if self.dimensions == 0 {
            return Err(VamanaError::InvalidConfig(
                "dimensions must be >= 1".to_string(),
            ));
        }
        if self.beam_size == 0 {
            return Err(VamanaError::InvalidConfig(
                "beam_size must be >= 1".to_string(),
            ));
        }
        if self.clusters == 0 {
            return Err(VamanaError::InvalidConfig(
                "clusters must be >= 1".to_string(),
            ));
        }
        if self.cluster_overlap == 0 || self.cluster_overlap > self.clusters {
            return Err(VamanaError::InvalidConfig(format!(
                "cluster_overlap must be in 1..={}, got {}",
                self.clusters, self.cluster_overlap
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> VamanaConfig {
        VamanaConfig {
            vector_count: 100,
            dimensions: 8,
            ..VamanaConfig::default()
        }
    }

    #[test]
    fn default_like_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_knobs() {
        for broken in [
            VamanaConfig { r: 0, ..valid() },
            VamanaConfig { l: 0, ..valid() },
            VamanaConfig {
                alpha: 0.9,
                ..valid()
            },
            VamanaConfig {
                dimensions: 0,
                ..valid()
            },
            VamanaConfig {
                beam_size: 0,
                ..valid()
            },
            VamanaConfig {
                clusters: 0,
                ..valid()
            },
            VamanaConfig {
                clusters: 2,
                cluster_overlap: 3,
                ..valid()
            },
        ] {
            assert!(broken.validate().is_err());
        }
    }

    #[test]
    fn alpha_nan_is_rejected() {
        let cfg = VamanaConfig {
            alpha: f32::NAN,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }
}
