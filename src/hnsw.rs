//! HNSW Index (C5): wraps `usearch`'s approximate-nearest-neighbor graph
//! with the spec's monotone-label incremental-update protocol, soft
//! deletes, and blue-green rebuild.
//!
//! Generalizes the teacher's `embedder.rs::WorkspaceVectorState` (one
//! usearch index per workspace, full-precision float vectors, no explicit
//! `id_mapping`/tombstone bookkeeping) to the spec's contract: one usearch
//! index per collection over quantized `u8` vectors, an explicit
//! `point_id -> label` map, and a tracked tombstone ratio driving rebuilds.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

use crate::error::{CidxError, CidxResult};
use crate::projection::Distance;
use crate::store::PointId;

pub const DEFAULT_M: usize = 16;
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
pub const DEFAULT_EF_SEARCH: usize = 50;

/// Rebuild trigger: tombstone ratio above which a full rebuild is
/// preferred over continuing to accumulate soft deletes.
pub const TOMBSTONE_REBUILD_RATIO: f32 = 0.3;

pub struct HnswIndex {
    index: usearch::Index,
    pub id_mapping: HashMap<PointId, u32>,
    pub tombstones: HashSet<u32>,
    dim: usize,
    distance: Distance,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
}

/// Outcome of a successful `rebuild`, logged by the caller.
#[derive(Debug, Clone, Copy)]
pub struct RebuildReport {
    pub vectors_carried_over: usize,
    pub tombstones_reclaimed: usize,
}

fn metric_for(distance: Distance) -> MetricKind {
    match distance {
        Distance::Cosine => MetricKind::Cos,
        Distance::L2 => MetricKind::L2sq,
    }
}

impl HnswIndex {
    pub fn new(dim: usize, distance: Distance, m: usize, ef_construction: usize, ef_search: usize) -> CidxResult<Self> {
        let options = IndexOptions {
            dimensions: dim,
            metric: metric_for(distance),
            quantization: ScalarKind::I8,
            connectivity: m,
            expansion_add: ef_construction,
            expansion_search: ef_search,
            multi: false,
        };
        let index = usearch::Index::new(&options)
            .map_err(|e| CidxError::Internal(anyhow::anyhow!("usearch init failed: {e}")))?;
        index
            .reserve(1024)
            .map_err(|e| CidxError::Internal(anyhow::anyhow!("usearch reserve failed: {e}")))?;
        Ok(Self {
            index,
            id_mapping: HashMap::new(),
            tombstones: HashSet::new(),
            dim,
            distance,
            m,
            ef_construction,
            ef_search,
        })
    }

    pub fn load(path: &Path, dim: usize, distance: Distance, m: usize, ef_construction: usize, ef_search: usize, id_mapping: HashMap<PointId, u32>, tombstones: HashSet<u32>) -> CidxResult<Self> {
        let mut hnsw = Self::new(dim, distance, m, ef_construction, ef_search)?;
        hnsw.index
            .load(path.to_string_lossy().as_ref())
            .map_err(|e| CidxError::Corruption(format!("failed to load hnsw index: {e}")))?;
        hnsw.id_mapping = id_mapping;
        hnsw.tombstones = tombstones;
        Ok(hnsw)
    }

    pub fn save(&self, path: &Path) -> CidxResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.index
            .save(path.to_string_lossy().as_ref())
            .map_err(|e| CidxError::Io(std::io::Error::other(format!("failed to save hnsw index: {e}"))))
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the incremental-update protocol (SPEC_FULL.md §4.5) over a
    /// batch of `(point_id, vector)` pairs. Labels are monotone: a known
    /// `point_id` reuses its label (replace semantics); an unknown one
    /// gets `label = |id_mapping|`.
    ///
    /// Assumes the caller already holds the collection's write lock — see
    /// `cache::CacheEntry`.
    pub fn incremental_update(&mut self, items: &[(PointId, Vec<f32>)]) -> CidxResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut labels = Vec::with_capacity(items.len());
        let mut vectors = Vec::with_capacity(items.len());

        for (point_id, vector) in items {
            if vector.len() != self.dim {
                return Err(CidxError::BadInput(format!(
                    "vector for {point_id} has dim {} but index expects {}",
                    vector.len(),
                    self.dim
                )));
            }
            let label = match self.id_mapping.get(point_id) {
                Some(&existing) => existing,
                None => {
                    let new_label = self.id_mapping.len() as u32;
                    self.id_mapping.insert(point_id.clone(), new_label);
                    new_label
                }
            };
            // Re-adding a point un-tombstones it (replace semantics).
            self.tombstones.remove(&label);
            labels.push(label as u64);
            vectors.push(vector.clone());
        }

        let needed = self.id_mapping.len();
        if needed > self.index.capacity() {
            let new_capacity = (needed as f64 * 1.5).ceil() as usize;
            tracing::warn!(new_capacity, "resizing hnsw index capacity");
            self.index
                .reserve(new_capacity)
                .map_err(|e| CidxError::Internal(anyhow::anyhow!("resize failed: {e}")))?;
        }

        for (label, vector) in labels.iter().zip(vectors.iter()) {
            self.index
                .add(*label, vector)
                .map_err(|e| CidxError::Internal(anyhow::anyhow!("add_items failed: {e}")))?;
        }

        Ok(())
    }

    /// Soft-delete: the label stays in `id_mapping` (may be undeleted by a
    /// later re-add) but is excluded from query results.
    pub fn remove(&mut self, point_id: &PointId) -> CidxResult<()> {
        if let Some(&label) = self.id_mapping.get(point_id) {
            let _ = self.index.remove(label as u64);
            self.tombstones.insert(label);
        }
        Ok(())
    }

    pub fn tombstone_ratio(&self) -> f32 {
        if self.id_mapping.is_empty() {
            return 0.0;
        }
        self.tombstones.len() as f32 / self.id_mapping.len() as f32
    }

    pub fn should_rebuild(&self) -> bool {
        self.tombstone_ratio() > TOMBSTONE_REBUILD_RATIO
    }

    /// Blue-green rebuild (SPEC_FULL.md §4.5): build a fresh shadow index
    /// from the still-live `(point_id, vector)` pairs, validate it against
    /// the live index, and only then swap it in. Tombstones never survive a
    /// rebuild — a point that was soft-deleted is simply absent from
    /// `live_points`.
    ///
    /// Validation has two legs: the shadow's vector count must land within
    /// `TOMBSTONE_REBUILD_RATIO`'s complement of what was handed in (guards
    /// against a shadow that silently dropped points), and a sample of the
    /// carried-over vectors must resolve to themselves as their own nearest
    /// neighbor in the shadow (guards against a mis-seeded or corrupt
    /// graph). Failure on either leg discards the shadow and leaves `self`
    /// untouched.
    pub fn rebuild(&mut self, live_points: Vec<(PointId, Vec<f32>)>) -> CidxResult<RebuildReport> {
        let reclaimed = self.tombstones.len();
        let expected = live_points.len();

        let mut shadow = Self::new(self.dim, self.distance, self.m, self.ef_construction, self.ef_search)?;
        shadow.incremental_update(&live_points)?;

        if expected > 0 {
            let drift = (shadow.len() as f32 - expected as f32).abs() / expected as f32;
            if drift > 0.05 {
                return Err(CidxError::Corruption(format!(
                    "hnsw rebuild produced {} vectors, expected ~{expected} (>5% drift); discarding shadow index",
                    shadow.len()
                )));
            }
        }

        let sample_stride = (live_points.len() / 8).max(1);
        for (point_id, vector) in live_points.iter().step_by(sample_stride) {
            let hits = shadow.search(vector, 1)?;
            if !hits.iter().any(|(id, _)| id == point_id) {
                return Err(CidxError::Corruption(format!(
                    "hnsw rebuild validation failed: {point_id} did not resolve to itself in the shadow index"
                )));
            }
        }

        *self = shadow;
        Ok(RebuildReport {
            vectors_carried_over: expected,
            tombstones_reclaimed: reclaimed,
        })
    }

    /// `knn_query`: returns `(point_id, distance)` pairs, nearest first,
    /// with tombstoned labels excluded by usearch itself (soft-deleted
    /// vectors are skipped during search).
    pub fn search(&self, vector: &[f32], k: usize) -> CidxResult<Vec<(PointId, f32)>> {
        if vector.len() != self.dim {
            return Err(CidxError::BadInput(format!(
                "query vector has dim {} but index expects {}",
                vector.len(),
                self.dim
            )));
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let matches = self
            .index
            .search(vector, k)
            .map_err(|e| CidxError::Internal(anyhow::anyhow!("knn_query failed: {e}")))?;

        let label_to_point: HashMap<u32, &PointId> =
            self.id_mapping.iter().map(|(id, label)| (*label, id)).collect();

        let mut results = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let label = *key as u32;
            if self.tombstones.contains(&label) {
                continue;
            }
            if let Some(point_id) = label_to_point.get(&label) {
                results.push(((*point_id).clone(), *distance));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_index() -> HnswIndex {
        HnswIndex::new(4, Distance::Cosine, DEFAULT_M, DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH).unwrap()
    }

    #[test]
    fn monotone_label_assignment() {
        let mut idx = new_index();
        idx.incremental_update(&[
            ("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0]),
            ("p2".to_string(), vec![0.0, 1.0, 0.0, 0.0]),
        ])
        .unwrap();
        assert_eq!(idx.id_mapping["p1"], 0);
        assert_eq!(idx.id_mapping["p2"], 1);
    }

    #[test]
    fn re_adding_same_point_id_reuses_label() {
        let mut idx = new_index();
        idx.incremental_update(&[("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        let first_label = idx.id_mapping["p1"];
        idx.incremental_update(&[("p1".to_string(), vec![0.0, 1.0, 0.0, 0.0])]).unwrap();
        assert_eq!(idx.id_mapping["p1"], first_label);
    }

    #[test]
    fn remove_is_idempotent_and_sets_tombstone() {
        let mut idx = new_index();
        idx.incremental_update(&[("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        idx.remove(&"p1".to_string()).unwrap();
        idx.remove(&"p1".to_string()).unwrap();
        assert_eq!(idx.tombstones.len(), 1);
        assert!(idx.id_mapping.contains_key("p1"));
    }

    #[test]
    fn re_add_after_remove_undeletes() {
        let mut idx = new_index();
        idx.incremental_update(&[("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        idx.remove(&"p1".to_string()).unwrap();
        idx.incremental_update(&[("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0])]).unwrap();
        assert!(idx.tombstones.is_empty());
    }

    #[test]
    fn tombstone_ratio_triggers_rebuild_threshold() {
        let mut idx = new_index();
        idx.incremental_update(&[
            ("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0]),
            ("p2".to_string(), vec![0.0, 1.0, 0.0, 0.0]),
            ("p3".to_string(), vec![0.0, 0.0, 1.0, 0.0]),
        ])
        .unwrap();
        idx.remove(&"p1".to_string()).unwrap();
        assert!(idx.should_rebuild()); // 1/3 ~= 0.33 > 0.3
    }

    #[test]
    fn rebuild_drops_tombstones_and_preserves_live_points() {
        let mut idx = new_index();
        idx.incremental_update(&[
            ("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0]),
            ("p2".to_string(), vec![0.0, 1.0, 0.0, 0.0]),
            ("p3".to_string(), vec![0.0, 0.0, 1.0, 0.0]),
        ])
        .unwrap();
        idx.remove(&"p1".to_string()).unwrap();

        let live = vec![
            ("p2".to_string(), vec![0.0, 1.0, 0.0, 0.0]),
            ("p3".to_string(), vec![0.0, 0.0, 1.0, 0.0]),
        ];
        let report = idx.rebuild(live).unwrap();
        assert_eq!(report.vectors_carried_over, 2);
        assert_eq!(report.tombstones_reclaimed, 1);
        assert!(idx.tombstones.is_empty());
        assert_eq!(idx.id_mapping.len(), 2);
        assert!(!idx.id_mapping.contains_key("p1"));
        assert!(idx.id_mapping.contains_key("p2"));
    }

    #[test]
    fn rebuild_rejects_shadow_with_excessive_vector_drift() {
        let mut idx = new_index();
        idx.incremental_update(&[("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0])]).unwrap();

        // Duplicate point_ids collapse to one label under the monotone
        // label protocol (replace semantics), so a caller that accidentally
        // hands over the same point_id twice gets a shadow with fewer
        // distinct vectors than `live_points.len()` implied — past the 5%
        // threshold here, which must be rejected rather than silently
        // swapped in.
        let duplicated: Vec<(PointId, Vec<f32>)> = (0..20).map(|_| ("dup".to_string(), vec![1.0, 0.0, 0.0, 0.0])).collect();
        let result = idx.rebuild(duplicated);
        assert!(result.is_err());
        // Original index must be untouched on a rejected rebuild.
        assert!(idx.id_mapping.contains_key("p1"));
    }

    #[test]
    fn search_excludes_tombstoned_labels() {
        let mut idx = new_index();
        idx.incremental_update(&[
            ("p1".to_string(), vec![1.0, 0.0, 0.0, 0.0]),
            ("p2".to_string(), vec![0.0, 1.0, 0.0, 0.0]),
        ])
        .unwrap();
        idx.remove(&"p1".to_string()).unwrap();
        let results = idx.search(&[1.0, 0.0, 0.0, 0.0], 10).unwrap();
        assert!(results.iter().all(|(id, _)| id != "p1"));
    }
}
