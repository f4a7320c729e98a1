//! Graph storage: in-memory edge lists or fixed-width rows on disk.
//!
//! The disk form packs one record per node at offset `id * (R*8 + D*4)`:
//! exactly `R` little-endian u64 neighbor slots followed by the node's raw
//! f32 vector. Slots beyond the true degree hold the node's own id as a
//! sentinel. A lookup is one positioned read; the file is memory-mapped and
//! shared read-only, so beam fetches need no cursor or lock.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;
use smallvec::SmallVec;

use crate::cache::HotCache;
use crate::distance::VectorFetch;
use crate::error::{Result, VamanaError};

/// Neighbor ids of one node; inline up to typical degrees.
pub type NeighborList = SmallVec<[u64; 32]>;

/// Write the corpus as fixed-width rows: for each id, `degree` neighbor
/// slots (self-padded) then the exact vector.
pub fn write_disk_graph(
    path: &Path,
    edges: &[Vec<u64>],
    degree: usize,
    dimensions: usize,
    fetch: &VectorFetch,
) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);

    for (id, neighbors) in edges.iter().enumerate() {
        if neighbors.len() > degree {
            return Err(VamanaError::CorruptIndex(format!(
                "node {} has degree {} over the limit {}",
                id,
                neighbors.len(),
                degree
            )));
        }
        let id = id as u64;
        for slot in 0..degree {
            let neighbor = neighbors.get(slot).copied().unwrap_or(id);
            writer.write_all(&neighbor.to_le_bytes())?;
        }
        let vector = fetch(id)?;
        if vector.len() != dimensions {
            return Err(VamanaError::DimensionMismatch {
                expected: dimensions,
                actual: vector.len(),
            });
        }
        writer.write_all(bytemuck::cast_slice(&vector))?;
    }

    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

/// Read-only fixed-width graph file, one mmap shared by all searches.
pub struct DiskGraph {
    mmap: Mmap,
    count: u64,
    degree: usize,
    dimensions: usize,
}

impl DiskGraph {
    const fn stride(degree: usize, dimensions: usize) -> usize {
        degree * 8 + dimensions * 4
    }

    /// Open and validate a graph file of `count` rows.
    pub fn open(path: &Path, count: u64, degree: usize, dimensions: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                VamanaError::CorruptIndex(format!("graph file missing: {}", path.display()))
            }
            _ => VamanaError::Io(e),
        })?;
        let actual = file.metadata()?.len();
        let expected = count * Self::stride(degree, dimensions) as u64;
        if actual != expected {
            return Err(VamanaError::CorruptIndex(format!(
                "graph file {} is {} bytes, expected {} for {} rows",
                path.display(),
                actual,
                expected,
                count
            )));
        }
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(Self {
            mmap,
            count,
            degree,
            dimensions,
        })
    }

    /// One positioned read: neighbor ids (sentinel slots dropped) and the
    /// node's exact vector.
    pub fn row(&self, id: u64) -> Result<(NeighborList, Vec<f32>)> {
        if id >= self.count {
            return Err(VamanaError::IdOutOfRange {
                id,
                count: self.count,
            });
        }
        let stride = Self::stride(self.degree, self.dimensions);
        let start = id as usize * stride;
        let record = &self.mmap[start..start + stride];

        let mut neighbors = NeighborList::new();
        for chunk in record[..self.degree * 8].chunks_exact(8) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            let neighbor = u64::from_le_bytes(buf);
            if neighbor != id {
                neighbors.push(neighbor);
            }
        }

        let mut vector = Vec::with_capacity(self.dimensions);
        for chunk in record[self.degree * 8..].chunks_exact(4) {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            vector.push(f32::from_le_bytes(buf));
        }

        Ok((neighbors, vector))
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Tagged graph backend; selected at build (memory) or open/switch (disk).
pub enum GraphStore {
    Memory(Vec<Vec<u64>>),
    Disk(DiskGraph),
}

impl GraphStore {
    /// Out-neighbors of `id`, plus the node's exact vector when the lookup
    /// had to touch disk. Disk lookups consult the hot cache first: a hit
    /// returns the cached neighbors with no I/O and no vector.
    pub fn neighbors(
        &self,
        id: u64,
        cache: Option<&HotCache>,
    ) -> Result<(NeighborList, Option<Vec<f32>>)> {
        match self {
            GraphStore::Memory(edges) => {
                let list = edges.get(id as usize).ok_or(VamanaError::IdOutOfRange {
                    id,
                    count: edges.len() as u64,
                })?;
                Ok((NeighborList::from_slice(list), None))
            }
            GraphStore::Disk(disk) => {
                if let Some(node) = cache.and_then(|c| c.get(id)) {
                    return Ok((NeighborList::from_slice(&node.neighbors), None));
                }
                let (neighbors, vector) = disk.row(id)?;
                Ok((neighbors, Some(vector)))
            }
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        match self {
            GraphStore::Memory(edges) => edges.len() as u64,
            GraphStore::Disk(disk) => disk.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::fetch_from_slice;

    fn corpus(n: usize, d: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| (0..d).map(|j| (i * d + j) as f32).collect())
            .collect()
    }

    #[test]
    fn disk_rows_roundtrip_neighbors_and_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.rows");
        let vectors = corpus(5, 3);
        let fetch = fetch_from_slice(vectors.clone());
        let edges = vec![vec![1, 2], vec![0], vec![4, 3, 1], vec![2], vec![0, 2]];

        write_disk_graph(&path, &edges, 3, 3, &fetch).unwrap();
        let disk = DiskGraph::open(&path, 5, 3, 3).unwrap();

        for id in 0..5u64 {
            let (neighbors, vector) = disk.row(id).unwrap();
            assert_eq!(neighbors.as_slice(), edges[id as usize].as_slice());
            assert_eq!(vector, vectors[id as usize]);
        }
    }

    #[test]
    fn padding_slots_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.rows");
        let fetch = fetch_from_slice(corpus(2, 2));
        // Node 0 has degree 1 of a possible 4.
        let edges = vec![vec![1], vec![0]];

        write_disk_graph(&path, &edges, 4, 2, &fetch).unwrap();
        let disk = DiskGraph::open(&path, 2, 4, 2).unwrap();
        let (neighbors, _) = disk.row(0).unwrap();
        assert_eq!(neighbors.as_slice(), &[1]);
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.rows");
        let fetch = fetch_from_slice(corpus(3, 2));
        let edges = vec![vec![1], vec![2], vec![0]];
        write_disk_graph(&path, &edges, 2, 2, &fetch).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(
            DiskGraph::open(&path, 3, 2, 2),
            Err(VamanaError::CorruptIndex(_))
        ));
    }

    #[test]
    fn missing_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DiskGraph::open(&dir.path().join("absent"), 1, 1, 1),
            Err(VamanaError::CorruptIndex(_))
        ));
    }

    #[test]
    fn disk_lookup_prefers_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.rows");
        let vectors = corpus(3, 2);
        let fetch = fetch_from_slice(vectors.clone());
        let edges = vec![vec![1, 2], vec![2], vec![0]];
        write_disk_graph(&path, &edges, 2, 2, &fetch).unwrap();

        let cache = HotCache::build(0, 1, &edges, &fetch).unwrap();
        let store = GraphStore::Disk(DiskGraph::open(&path, 3, 2, 2).unwrap());

        let (neighbors, vector) = store.neighbors(0, Some(&cache)).unwrap();
        assert_eq!(neighbors.as_slice(), &[1, 2]);
        assert!(vector.is_none(), "cache hit must not touch disk");

        let (_, vector) = store.neighbors(1, Some(&cache)).unwrap();
        assert_eq!(vector.unwrap(), vectors[1]);
    }

    #[test]
    fn oversized_neighbor_list_is_rejected_at_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.rows");
        let fetch = fetch_from_slice(corpus(2, 2));
        let edges = vec![vec![1, 1, 1], vec![0]];
        assert!(write_disk_graph(&path, &edges, 2, 2, &fetch).is_err());
    }
}
