//! Vector Store (C4): content-addressed on-disk storage of quantized chunk
//! vectors, their metadata, and a point index for O(1) lookup.
//!
//! On-disk layout (SPEC_FULL.md §4.4), rooted at `<project>/.cidx/index/<collection>/`:
//! - `meta.json`
//! - `projection.bin`
//! - `points/<first-two-hex>/<id>.vec`
//! - `points/index.bin`
//! - `hnsw/index.bin`, `hnsw/id_mapping.json`, `hnsw/tombstones.bin`
//!
//! Atomic-write discipline is grounded on the teacher's `workspace.rs`
//! (`workspaces.json` write-to-temp-then-rename) and `indexer.rs`'s sidecar
//! hash-file writes.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CidxError, CidxResult};
use crate::projection::{Distance, QuantizedVector};

pub type PointId = String;

/// Deterministic chunk identity: `H(relpath || start_line || end_line ||
/// content)`. Two chunks with the same inputs always get the same id,
/// which is how re-indexing deduplicates unchanged chunks.
pub fn compute_point_id(relpath: &str, start_line: usize, end_line: usize, content: &str) -> PointId {
    let mut hasher = Sha256::new();
    hasher.update(relpath.as_bytes());
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Code,
    CommitMessage,
    CommitDiff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointMetadata {
    pub path: String,
    pub language: String,
    pub line_start: usize,
    pub line_end: usize,
    pub chunk_type: ChunkType,
    pub commit_hash: Option<String>,
    pub author: Option<String>,
    pub timestamp: Option<i64>,
    /// Branch names under which this point is currently visible.
    pub branch_visibility: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Point {
    pub point_id: PointId,
    pub label: Option<u32>,
    pub quantized: QuantizedVector,
    pub metadata: PointMetadata,
}

/// On-disk record shape for a single `.vec` file.
#[derive(Debug, Serialize, Deserialize)]
struct VecFileRecord {
    point_id: PointId,
    label: Option<u32>,
    quantized_bytes: Vec<u8>,
    min_bits: u32,
    max_bits: u32,
    metadata: PointMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub schema_version: u32,
    pub dim: usize,
    pub dim_prime: usize,
    pub distance: Distance,
    pub vector_count: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub last_full_build: Option<i64>,
    pub stale: bool,
    pub tombstoned_labels: Vec<u32>,
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub struct VectorStore {
    root: PathBuf,
}

impl VectorStore {
    pub fn open(root: PathBuf) -> CidxResult<Self> {
        fs::create_dir_all(root.join("points"))?;
        fs::create_dir_all(root.join("hnsw"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn projection_path(&self) -> PathBuf {
        self.root.join("projection.bin")
    }

    pub fn hnsw_index_path(&self) -> PathBuf {
        self.root.join("hnsw").join("index.bin")
    }

    pub fn id_mapping_path(&self) -> PathBuf {
        self.root.join("hnsw").join("id_mapping.json")
    }

    pub fn load_meta(&self) -> CidxResult<Option<CollectionMeta>> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let meta: CollectionMeta = serde_json::from_str(&raw)
            .map_err(|e| CidxError::Corruption(format!("meta.json: {e}")))?;
        Ok(Some(meta))
    }

    pub fn save_meta(&self, meta: &CollectionMeta) -> CidxResult<()> {
        atomic_write(&self.meta_path(), serde_json::to_string_pretty(meta)?.as_bytes())
    }

    fn vec_file_path(&self, point_id: &PointId) -> PathBuf {
        let prefix = &point_id[..2.min(point_id.len())];
        self.root.join("points").join(prefix).join(format!("{point_id}.vec"))
    }

    /// Write (or overwrite) one point's `.vec` file atomically.
    pub fn upsert_point(&self, point: &Point) -> CidxResult<()> {
        let path = self.vec_file_path(&point.point_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record = VecFileRecord {
            point_id: point.point_id.clone(),
            label: point.label,
            quantized_bytes: point.quantized.bytes.clone(),
            min_bits: point.quantized.min_bits,
            max_bits: point.quantized.max_bits,
            metadata: point.metadata.clone(),
        };

        atomic_write(&path, serde_json::to_vec(&record)?.as_slice())?;
        self.append_index_entry(&point.point_id)?;
        Ok(())
    }

    pub fn get(&self, point_id: &PointId) -> CidxResult<Option<Point>> {
        let path = self.vec_file_path(point_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let record: VecFileRecord = serde_json::from_slice(&raw)
            .map_err(|e| CidxError::Corruption(format!("{}: {e}", path.display())))?;
        Ok(Some(Point {
            point_id: record.point_id,
            label: record.label,
            quantized: QuantizedVector {
                bytes: record.quantized_bytes,
                min_bits: record.min_bits,
                max_bits: record.max_bits,
            },
            metadata: record.metadata,
        }))
    }

    pub fn delete(&self, point_id: &PointId) -> CidxResult<()> {
        let path = self.vec_file_path(point_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Lazily enumerate every point currently on disk whose metadata
    /// satisfies `filter`. Not restartable across mutations — callers that
    /// need a stable view should collect into a `Vec` up front.
    pub fn scan(&self, filter: impl Fn(&PointMetadata) -> bool) -> CidxResult<Vec<Point>> {
        let points_dir = self.root.join("points");
        let mut results = Vec::new();
        if !points_dir.exists() {
            return Ok(results);
        }
        for shard in fs::read_dir(&points_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if entry.path().extension().and_then(|e| e.to_str()) != Some("vec") {
                    continue;
                }
                let raw = fs::read(entry.path())?;
                let record: VecFileRecord = match serde_json::from_slice(&raw) {
                    Ok(r) => r,
                    Err(_) => continue, // partially-written file mid-scan; skip
                };
                if filter(&record.metadata) {
                    results.push(Point {
                        point_id: record.point_id,
                        label: record.label,
                        quantized: QuantizedVector {
                            bytes: record.quantized_bytes,
                            min_bits: record.min_bits,
                            max_bits: record.max_bits,
                        },
                        metadata: record.metadata,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Append-only `point_id -> file offset` map. The spec treats this as
    /// an accelerator, rebuildable from `points/*` if lost — so a failure
    /// to append is logged, not fatal, and `rebuild_index` recovers it.
    fn append_index_entry(&self, point_id: &PointId) -> CidxResult<()> {
        let index_path = self.root.join("points").join("index.bin");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)?;
        writeln!(file, "{point_id}")?;
        file.sync_all()?;
        Ok(())
    }

    /// Rebuild `points/index.bin` from the `.vec` files themselves. Used
    /// when the index file is missing or found corrupt.
    pub fn rebuild_point_index(&self) -> CidxResult<usize> {
        let all_ids: Vec<PointId> = self.scan(|_| true)?.into_iter().map(|p| p.point_id).collect();
        let index_path = self.root.join("points").join("index.bin");
        let tmp_path = index_path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            for id in &all_ids {
                writeln!(file, "{id}")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &index_path)?;
        Ok(all_ids.len())
    }

    pub fn save_id_mapping(&self, mapping: &HashMap<PointId, u32>) -> CidxResult<()> {
        atomic_write(&self.id_mapping_path(), serde_json::to_vec(mapping)?.as_slice())
    }

    pub fn load_id_mapping(&self) -> CidxResult<HashMap<PointId, u32>> {
        let path = self.id_mapping_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = fs::read(&path)?;
        serde_json::from_slice(&raw).map_err(|e| CidxError::Corruption(format!("id_mapping.json: {e}")))
    }
}

/// Write `bytes` to a temp path beside `path`, then atomically rename over
/// it. Partial writes are never observable at `path`.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> CidxResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::quantize;

    fn sample_point(id: &str) -> Point {
        Point {
            point_id: id.to_string(),
            label: Some(0),
            quantized: quantize(&[0.1, 0.2, 0.3]),
            metadata: PointMetadata {
                path: "a.py".to_string(),
                language: "python".to_string(),
                line_start: 1,
                line_end: 1,
                chunk_type: ChunkType::Code,
                commit_hash: None,
                author: None,
                timestamp: None,
                branch_visibility: vec!["main".to_string()],
            },
        }
    }

    #[test]
    fn point_id_is_deterministic() {
        let a = compute_point_id("a.py", 1, 2, "hello");
        let b = compute_point_id("a.py", 1, 2, "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn point_id_changes_with_content() {
        let a = compute_point_id("a.py", 1, 2, "hello");
        let b = compute_point_id("a.py", 1, 2, "goodbye");
        assert_ne!(a, b);
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path().to_path_buf()).unwrap();
        let point = sample_point("deadbeef");
        store.upsert_point(&point).unwrap();
        let fetched = store.get(&"deadbeef".to_string()).unwrap().unwrap();
        assert_eq!(fetched.metadata.path, "a.py");
    }

    #[test]
    fn delete_removes_point() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path().to_path_buf()).unwrap();
        let point = sample_point("cafebabe");
        store.upsert_point(&point).unwrap();
        store.delete(&"cafebabe".to_string()).unwrap();
        assert!(store.get(&"cafebabe".to_string()).unwrap().is_none());
    }

    #[test]
    fn scan_filters_by_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path().to_path_buf()).unwrap();
        store.upsert_point(&sample_point("11112222")).unwrap();
        let mut other = sample_point("33334444");
        other.metadata.path = "b.py".to_string();
        store.upsert_point(&other).unwrap();

        let results = store.scan(|m| m.path == "a.py").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn rebuild_point_index_recovers_from_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path().to_path_buf()).unwrap();
        store.upsert_point(&sample_point("55556666")).unwrap();
        let count = store.rebuild_point_index().unwrap();
        assert_eq!(count, 1);
    }
}
