//! On-disk persistence of the index as a self-contained directory.
//!
//! # Directory layout
//!
//! ```text
//! index-dir/
//! ├── config.json    # versioned manifest with the full configuration
//! ├── data.bin       # entry point, graph path, cached edges, PQ codes
//! ├── graph.bin      # edge lists (memory-resident indexes only)
//! ├── pq.bin         # codebooks (disk-resident indexes only)
//! └── cache.bits     # packed hot-cache bitmap (disk-resident only)
//! ```
//!
//! A disk-resident index additionally references its fixed-width graph file
//! at the path recorded inside `data.bin`; that file is produced by
//! [`switch_to_disk`](crate::VamanaIndex::switch_to_disk) and is not copied
//! on save.
//!
//! Binary artifacts are little-endian with magic bytes and an explicit
//! format version; any missing artifact, bad magic, or length that
//! disagrees with the configured vector count decodes as `CorruptIndex`.
//! The fetch and distance callbacks are never serialized.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bitset::BitSet;
use crate::cache::{CachedNode, HotCache};
use crate::config::VamanaConfig;
use crate::distance::{DistanceFn, VectorFetch};
use crate::error::{Result, VamanaError};
use crate::graph::{DiskGraph, GraphStore};
use crate::index::VamanaIndex;
use crate::pq::ProductQuantizer;

pub const CONFIG_FILE: &str = "config.json";
pub const DATA_FILE: &str = "data.bin";
pub const GRAPH_FILE: &str = "graph.bin";
pub const PQ_FILE: &str = "pq.bin";
pub const CACHE_BITMAP_FILE: &str = "cache.bits";

const DATA_MAGIC: &[u8; 8] = b"VMDT\x00\x00\x00\x01";
const GRAPH_MAGIC: &[u8; 8] = b"VMGR\x00\x00\x00\x01";
const PQ_MAGIC: &[u8; 8] = b"VMPQ\x00\x00\x00\x01";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ConfigManifest {
    version: u32,
    config: VamanaConfig,
}

pub(crate) fn save(index: &VamanaIndex, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    info!(dir = %dir.display(), on_disk = index.on_disk, "saving index");

    let manifest = ConfigManifest {
        version: FORMAT_VERSION,
        config: index.config.clone(),
    };
    let config_file = BufWriter::new(File::create(dir.join(CONFIG_FILE))?);
    serde_json::to_writer_pretty(config_file, &manifest)
        .map_err(|e| VamanaError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;

    write_data(index, &dir.join(DATA_FILE))?;

    match &index.graph {
        GraphStore::Memory(edges) => write_graph(edges, &dir.join(GRAPH_FILE))?,
        GraphStore::Disk(_) => {
            let pq = index.pq.as_deref().ok_or_else(|| {
                VamanaError::CorruptIndex("disk-resident index without quantizer".to_string())
            })?;
            write_pq(pq, &dir.join(PQ_FILE))?;
            let cache = index.cache.as_ref().ok_or_else(|| {
                VamanaError::CorruptIndex("disk-resident index without hot cache".to_string())
            })?;
            fs::write(dir.join(CACHE_BITMAP_FILE), cache.bitmap().to_bytes())?;
        }
    }
    Ok(())
}

pub(crate) fn open(dir: &Path, fetch: VectorFetch, distance: DistanceFn) -> Result<VamanaIndex> {
    let config_file = open_artifact(&dir.join(CONFIG_FILE))?;
    let manifest: ConfigManifest = serde_json::from_reader(BufReader::new(config_file))
        .map_err(|e| VamanaError::CorruptIndex(format!("config manifest: {e}")))?;
    if manifest.version != FORMAT_VERSION {
        return Err(VamanaError::CorruptIndex(format!(
            "unsupported format version {}",
            manifest.version
        )));
    }
    let config = manifest.config;
    config.validate()?;
    let count = config.vector_count;

    let data = read_data(&dir.join(DATA_FILE), &config)?;
    if count > 0 && data.entry_point >= count {
        return Err(VamanaError::CorruptIndex(format!(
            "entry point {} out of range for {} vectors",
            data.entry_point, count
        )));
    }

    let index = if data.on_disk {
        let pq = read_pq(&dir.join(PQ_FILE), &config)?;
        if data.codes.len() as u64 != count {
            return Err(VamanaError::CorruptIndex(format!(
                "{} PQ codes for {} vectors",
                data.codes.len(),
                count
            )));
        }
        for (id, code) in data.codes.iter().enumerate() {
            if !code.is_empty() && code.len() != pq.segments() {
                return Err(VamanaError::CorruptIndex(format!(
                    "code for id {} has {} segments, quantizer expects {}",
                    id,
                    code.len(),
                    pq.segments()
                )));
            }
        }

        let bitmap_bytes = fs::read(dir.join(CACHE_BITMAP_FILE)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                VamanaError::CorruptIndex(format!("missing artifact {CACHE_BITMAP_FILE}"))
            } else {
                VamanaError::Io(e)
            }
        })?;
        let bitmap = BitSet::from_bytes(&bitmap_bytes, count as usize)?;
        if bitmap.count() != data.cached.len() {
            return Err(VamanaError::CorruptIndex(format!(
                "cache bitmap marks {} ids but {} nodes are cached",
                bitmap.count(),
                data.cached.len()
            )));
        }
        for &id in data.cached.keys() {
            if !bitmap.contains(id) {
                return Err(VamanaError::CorruptIndex(format!(
                    "cached id {id} absent from the cache bitmap"
                )));
            }
            if !data.codes[id as usize].is_empty() {
                return Err(VamanaError::CorruptIndex(format!(
                    "cached id {id} also carries a PQ code"
                )));
            }
        }
        if !bitmap.contains(data.entry_point) || !data.cached.contains_key(&data.entry_point) {
            return Err(VamanaError::CorruptIndex(
                "entry point missing from the hot cache".to_string(),
            ));
        }
        let cache = HotCache::from_parts(data.cached, bitmap);

        let graph_path = PathBuf::from(&data.graph_path);
        if data.graph_path.is_empty() {
            return Err(VamanaError::CorruptIndex(
                "disk-resident index without a graph path".to_string(),
            ));
        }
        let disk = DiskGraph::open(&graph_path, count, config.r, config.dimensions)?;

        VamanaIndex {
            config,
            entry_point: data.entry_point,
            graph: GraphStore::Disk(disk),
            graph_path: Some(graph_path),
            cache: Some(cache),
            pq: Some(Arc::new(pq)),
            codes: Some(Arc::new(data.codes)),
            fetch,
            distance,
            on_disk: true,
        }
    } else {
        let edges = read_graph(&dir.join(GRAPH_FILE), &config)?;
        VamanaIndex {
            config,
            entry_point: data.entry_point,
            graph: GraphStore::Memory(edges),
            graph_path: None,
            cache: None,
            pq: None,
            codes: None,
            fetch,
            distance,
            on_disk: false,
        }
    };

    info!(dir = %dir.display(), on_disk = index.on_disk, "opened index");
    Ok(index)
}

struct DataArtifact {
    entry_point: u64,
    on_disk: bool,
    graph_path: String,
    codes: Vec<Vec<u8>>,
    cached: HashMap<u64, CachedNode>,
}

fn write_data(index: &VamanaIndex, path: &Path) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(DATA_MAGIC)?;
    w.write_all(&index.entry_point.to_le_bytes())?;
    w.write_all(&[u8::from(index.on_disk)])?;

    let graph_path = index
        .graph_path
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    write_block(&mut w, graph_path.as_bytes())?;

    match &index.codes {
        Some(codes) => {
            w.write_all(&(codes.len() as u64).to_le_bytes())?;
            for code in codes.iter() {
                write_block(&mut w, code)?;
            }
        }
        None => w.write_all(&0u64.to_le_bytes())?,
    }

    match &index.cache {
        Some(cache) => {
            let mut ids: Vec<u64> = cache.nodes().keys().copied().collect();
            ids.sort_unstable();
            w.write_all(&(ids.len() as u64).to_le_bytes())?;
            for id in ids {
                let node = &cache.nodes()[&id];
                w.write_all(&id.to_le_bytes())?;
                w.write_all(bytemuck::cast_slice(&node.vector))?;
                w.write_all(&(node.neighbors.len() as u32).to_le_bytes())?;
                for &n in &node.neighbors {
                    w.write_all(&n.to_le_bytes())?;
                }
            }
        }
        None => w.write_all(&0u64.to_le_bytes())?,
    }

    w.flush()?;
    Ok(())
}

fn read_data(path: &Path, config: &VamanaConfig) -> Result<DataArtifact> {
    let mut r = BufReader::new(open_artifact(path)?);
    expect_magic(&mut r, DATA_MAGIC, DATA_FILE)?;

    let entry_point = read_u64(&mut r, "entry point")?;
    let on_disk = match read_u8(&mut r, "on-disk flag")? {
        0 => false,
        1 => true,
        other => {
            return Err(VamanaError::CorruptIndex(format!(
                "on-disk flag must be 0 or 1, got {other}"
            )))
        }
    };
    let graph_path_bytes = read_block(&mut r, "graph path")?;
    let graph_path = String::from_utf8(graph_path_bytes)
        .map_err(|_| VamanaError::CorruptIndex("graph path is not UTF-8".to_string()))?;

    let code_count = read_u64(&mut r, "code count")?;
    if code_count > config.vector_count {
        return Err(VamanaError::CorruptIndex(format!(
            "{} PQ codes for {} vectors",
            code_count, config.vector_count
        )));
    }
    let mut codes = Vec::with_capacity(code_count as usize);
    for _ in 0..code_count {
        codes.push(read_block(&mut r, "PQ code")?);
    }

    let cached_count = read_u64(&mut r, "cached node count")?;
    if cached_count > config.vector_count {
        return Err(VamanaError::CorruptIndex(format!(
            "{} cached nodes for {} vectors",
            cached_count, config.vector_count
        )));
    }
    let mut cached = HashMap::with_capacity(cached_count as usize);
    for _ in 0..cached_count {
        let id = read_u64(&mut r, "cached id")?;
        if id >= config.vector_count {
            return Err(VamanaError::CorruptIndex(format!(
                "cached id {id} out of range"
            )));
        }
        let vector = read_f32s(&mut r, config.dimensions, "cached vector")?;
        let degree = read_u32(&mut r, "cached degree")? as usize;
        if degree > config.r {
            return Err(VamanaError::CorruptIndex(format!(
                "cached id {id} has degree {degree} over the limit {}",
                config.r
            )));
        }
        let mut neighbors = Vec::with_capacity(degree);
        for _ in 0..degree {
            let n = read_u64(&mut r, "cached neighbor")?;
            if n >= config.vector_count {
                return Err(VamanaError::CorruptIndex(format!(
                    "cached id {id} references neighbor {n} outside [0, {})",
                    config.vector_count
                )));
            }
            neighbors.push(n);
        }
        cached.insert(id, CachedNode { vector, neighbors });
    }

    expect_eof(&mut r, DATA_FILE)?;
    Ok(DataArtifact {
        entry_point,
        on_disk,
        graph_path,
        codes,
        cached,
    })
}

fn write_graph(edges: &[Vec<u64>], path: &Path) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(GRAPH_MAGIC)?;
    w.write_all(&(edges.len() as u64).to_le_bytes())?;
    for neighbors in edges {
        w.write_all(&(neighbors.len() as u32).to_le_bytes())?;
        for &n in neighbors {
            w.write_all(&n.to_le_bytes())?;
        }
    }
    w.flush()?;
    Ok(())
}

fn read_graph(path: &Path, config: &VamanaConfig) -> Result<Vec<Vec<u64>>> {
    let mut r = BufReader::new(open_artifact(path)?);
    expect_magic(&mut r, GRAPH_MAGIC, GRAPH_FILE)?;

    let count = read_u64(&mut r, "node count")?;
    if count != config.vector_count {
        return Err(VamanaError::CorruptIndex(format!(
            "graph holds {} nodes, config says {}",
            count, config.vector_count
        )));
    }
    let mut edges = Vec::with_capacity(count as usize);
    for id in 0..count {
        let degree = read_u32(&mut r, "degree")? as usize;
        if degree > config.r {
            return Err(VamanaError::CorruptIndex(format!(
                "node {id} has degree {degree} over the limit {}",
                config.r
            )));
        }
        let mut neighbors = Vec::with_capacity(degree);
        for _ in 0..degree {
            let n = read_u64(&mut r, "neighbor id")?;
            if n >= count {
                return Err(VamanaError::CorruptIndex(format!(
                    "node {id} references neighbor {n} outside [0, {count})"
                )));
            }
            neighbors.push(n);
        }
        edges.push(neighbors);
    }
    expect_eof(&mut r, GRAPH_FILE)?;
    Ok(edges)
}

fn write_pq(pq: &ProductQuantizer, path: &Path) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(PQ_MAGIC)?;
    w.write_all(&(pq.dimensions() as u32).to_le_bytes())?;
    w.write_all(&(pq.segments() as u32).to_le_bytes())?;
    w.write_all(&(pq.centroids() as u32).to_le_bytes())?;
    for codebook in pq.codebooks() {
        for codeword in codebook {
            w.write_all(bytemuck::cast_slice(codeword))?;
        }
    }
    w.flush()?;
    Ok(())
}

fn read_pq(path: &Path, config: &VamanaConfig) -> Result<ProductQuantizer> {
    let mut r = BufReader::new(open_artifact(path)?);
    expect_magic(&mut r, PQ_MAGIC, PQ_FILE)?;

    let dimensions = read_u32(&mut r, "PQ dimensions")? as usize;
    if dimensions != config.dimensions {
        return Err(VamanaError::CorruptIndex(format!(
            "quantizer trained for {} dimensions, config says {}",
            dimensions, config.dimensions
        )));
    }
    let segments = read_u32(&mut r, "PQ segments")? as usize;
    let centroids = read_u32(&mut r, "PQ centroids")? as usize;
    let mut pq = ProductQuantizer::new(dimensions, segments, centroids).map_err(|e| {
        VamanaError::CorruptIndex(format!("persisted quantizer layout invalid: {e}"))
    })?;

    let segment_dim = dimensions / segments;
    let mut codebooks = Vec::with_capacity(segments);
    for _ in 0..segments {
        let mut codebook = Vec::with_capacity(centroids);
        for _ in 0..centroids {
            codebook.push(read_f32s(&mut r, segment_dim, "codeword")?);
        }
        codebooks.push(codebook);
    }
    expect_eof(&mut r, PQ_FILE)?;
    pq.set_codebooks(codebooks)?;
    Ok(pq)
}

fn open_artifact(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            VamanaError::CorruptIndex(format!("missing artifact {}", path.display()))
        } else {
            VamanaError::Io(e)
        }
    })
}

fn expect_magic(r: &mut impl Read, magic: &[u8; 8], what: &str) -> Result<()> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf, what)?;
    if &buf != magic {
        return Err(VamanaError::CorruptIndex(format!("bad magic in {what}")));
    }
    Ok(())
}

fn expect_eof(r: &mut impl Read, what: &str) -> Result<()> {
    let mut probe = [0u8; 1];
    match r.read(&mut probe)? {
        0 => Ok(()),
        _ => Err(VamanaError::CorruptIndex(format!(
            "trailing bytes in {what}"
        ))),
    }
}

fn read_exact(r: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            VamanaError::CorruptIndex(format!("truncated {what}"))
        } else {
            VamanaError::Io(e)
        }
    })
}

fn read_u8(r: &mut impl Read, what: &str) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf, what)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf, what)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf, what)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32s(r: &mut impl Read, n: usize, what: &str) -> Result<Vec<f32>> {
    let mut bytes = vec![0u8; n * 4];
    read_exact(r, &mut bytes, what)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(c);
            f32::from_le_bytes(buf)
        })
        .collect())
}

/// Length-prefixed byte block: u32 length then the payload.
fn write_block(w: &mut impl Write, bytes: &[u8]) -> Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)?;
    Ok(())
}

// Blocks are short (paths and PQ codes); anything larger is corruption.
const MAX_BLOCK: u32 = 1 << 20;

fn read_block(r: &mut impl Read, what: &str) -> Result<Vec<u8>> {
    let len = read_u32(r, what)?;
    if len > MAX_BLOCK {
        return Err(VamanaError::CorruptIndex(format!(
            "{what} block of {len} bytes exceeds the {MAX_BLOCK} limit"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    read_exact(r, &mut bytes, what)?;
    Ok(bytes)
}
