//! Integration tests for index persistence.
//!
//! Tests the full cycle: build -> save -> open -> search, for both
//! residency modes, plus corruption detection at open time.

use std::fs;

use vamana::persist::{CACHE_BITMAP_FILE, CONFIG_FILE, DATA_FILE, GRAPH_FILE, PQ_FILE};
use vamana::{fetch_from_slice, l2_squared_kernel, VamanaConfig, VamanaError, VamanaIndex};

/// Generate random vectors for testing.
fn generate_vectors(n: usize, d: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut state = seed;
    let mut next = || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((state >> 33) as f32) / (u32::MAX as f32) - 0.5
    };

    (0..n).map(|_| (0..d).map(|_| next()).collect()).collect()
}

fn build_index(corpus: &[Vec<f32>]) -> VamanaIndex {
    let config = VamanaConfig {
        r: 16,
        l: 32,
        alpha: 1.2,
        vector_count: corpus.len() as u64,
        dimensions: corpus[0].len(),
        cache_size: 32,
        seed: 42,
        ..VamanaConfig::default()
    };
    VamanaIndex::build(config, fetch_from_slice(corpus.to_vec()), l2_squared_kernel())
        .expect("build failed")
}

fn reopen(dir: &std::path::Path, corpus: &[Vec<f32>]) -> VamanaIndex {
    VamanaIndex::open(dir, fetch_from_slice(corpus.to_vec()), l2_squared_kernel())
        .expect("open failed")
}

#[test]
fn memory_index_roundtrips_and_requeries_identically() {
    let corpus = generate_vectors(256, 16, 42);
    let index = build_index(&corpus);

    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("idx");
    index.save(&dir).expect("save failed");

    assert!(dir.join(CONFIG_FILE).exists());
    assert!(dir.join(DATA_FILE).exists());
    assert!(dir.join(GRAPH_FILE).exists());

    let reopened = reopen(&dir, &corpus);
    assert_eq!(reopened.entry_point(), index.entry_point());
    assert_eq!(reopened.config(), index.config());
    assert_eq!(reopened.graph().unwrap(), index.graph().unwrap());

    for query in corpus.iter().take(50) {
        let a = index.search_by_vector(query, 10).unwrap();
        let b = reopened.search_by_vector(query, 10).unwrap();
        assert_eq!(a, b, "reopened index answered differently");
    }
}

#[test]
fn saved_artifacts_are_bit_stable_across_a_roundtrip() {
    let corpus = generate_vectors(128, 8, 7);
    let index = build_index(&corpus);

    let tmp = tempfile::tempdir().unwrap();
    let first = tmp.path().join("a");
    let second = tmp.path().join("b");
    index.save(&first).unwrap();

    let reopened = reopen(&first, &corpus);
    reopened.save(&second).unwrap();

    for file in [CONFIG_FILE, DATA_FILE, GRAPH_FILE] {
        let a = fs::read(first.join(file)).unwrap();
        let b = fs::read(second.join(file)).unwrap();
        assert_eq!(a, b, "{file} changed across a save/open/save cycle");
    }
}

#[test]
fn disk_index_roundtrips_with_pq_and_cache() {
    let corpus = generate_vectors(256, 16, 42);
    let mut index = build_index(&corpus);

    let tmp = tempfile::tempdir().unwrap();
    let graph_path = tmp.path().join("graph.rows");
    index.switch_to_disk(&graph_path, 4, 16).unwrap();

    let first = tmp.path().join("a");
    let second = tmp.path().join("b");
    index.save(&first).unwrap();
    assert!(first.join(PQ_FILE).exists());
    assert!(first.join(CACHE_BITMAP_FILE).exists());
    assert!(!first.join(GRAPH_FILE).exists(), "edge list stays external on disk");

    let reopened = reopen(&first, &corpus);
    assert!(reopened.is_on_disk());
    assert_eq!(reopened.entry_point(), index.entry_point());

    for query in corpus.iter().take(20) {
        let a = index.search_by_vector(query, 10).unwrap();
        let b = reopened.search_by_vector(query, 10).unwrap();
        assert_eq!(a, b, "reopened disk index answered differently");
    }

    // Entry point, PQ codes, codebooks and hot cache must survive the trip
    // bit for bit.
    reopened.save(&second).unwrap();
    for file in [CONFIG_FILE, DATA_FILE, PQ_FILE, CACHE_BITMAP_FILE] {
        let a = fs::read(first.join(file)).unwrap();
        let b = fs::read(second.join(file)).unwrap();
        assert_eq!(a, b, "{file} changed across a save/open/save cycle");
    }
}

#[test]
fn missing_artifacts_are_reported_as_corruption() {
    let corpus = generate_vectors(64, 8, 3);
    let index = build_index(&corpus);

    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("idx");
    index.save(&dir).unwrap();

    for file in [CONFIG_FILE, DATA_FILE, GRAPH_FILE] {
        let victim = tmp.path().join("victim");
        copy_dir(&dir, &victim);
        fs::remove_file(victim.join(file)).unwrap();
        let err = VamanaIndex::open(
            &victim,
            fetch_from_slice(corpus.clone()),
            l2_squared_kernel(),
        )
        .unwrap_err();
        assert!(
            matches!(err, VamanaError::CorruptIndex(_)),
            "deleting {file} produced {err:?}"
        );
        fs::remove_dir_all(&victim).unwrap();
    }
}

#[test]
fn truncated_data_is_reported_as_corruption() {
    let corpus = generate_vectors(64, 8, 4);
    let index = build_index(&corpus);

    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("idx");
    index.save(&dir).unwrap();

    let data = fs::read(dir.join(DATA_FILE)).unwrap();
    fs::write(dir.join(DATA_FILE), &data[..data.len() / 2]).unwrap();

    let err = VamanaIndex::open(&dir, fetch_from_slice(corpus), l2_squared_kernel()).unwrap_err();
    assert!(matches!(err, VamanaError::CorruptIndex(_)));
}

#[test]
fn foreign_magic_is_reported_as_corruption() {
    let corpus = generate_vectors(64, 8, 5);
    let index = build_index(&corpus);

    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("idx");
    index.save(&dir).unwrap();

    let mut graph = fs::read(dir.join(GRAPH_FILE)).unwrap();
    graph[0] ^= 0xFF;
    fs::write(dir.join(GRAPH_FILE), graph).unwrap();

    let err = VamanaIndex::open(&dir, fetch_from_slice(corpus), l2_squared_kernel()).unwrap_err();
    assert!(matches!(err, VamanaError::CorruptIndex(_)));
}

#[test]
fn graph_node_count_must_match_config() {
    let corpus = generate_vectors(32, 8, 6);
    let index = build_index(&corpus);

    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("idx");
    index.save(&dir).unwrap();

    // Rewrite the node count inside graph.bin (bytes 8..16, little-endian).
    let mut graph = fs::read(dir.join(GRAPH_FILE)).unwrap();
    graph[8..16].copy_from_slice(&31u64.to_le_bytes());
    fs::write(dir.join(GRAPH_FILE), graph).unwrap();

    let err = VamanaIndex::open(&dir, fetch_from_slice(corpus), l2_squared_kernel()).unwrap_err();
    assert!(matches!(err, VamanaError::CorruptIndex(_)));
}

#[test]
fn opening_an_empty_directory_fails_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let err = VamanaIndex::open(
        tmp.path(),
        fetch_from_slice(vec![vec![0.0]]),
        l2_squared_kernel(),
    )
    .unwrap_err();
    assert!(matches!(err, VamanaError::CorruptIndex(_)));
}

fn copy_dir(from: &std::path::Path, to: &std::path::Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}
