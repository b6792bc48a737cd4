//! Indexing Orchestrator (C8): discovers files, chunks them, embeds the
//! chunks in batches, and upserts the resulting points into the vector
//! store, FTS index, and HNSW graph for a collection.
//!
//! The two-stage shape (discover+chunk feeding a bounded channel that
//! embed+upsert drains) merges the teacher's `indexer.rs` discovery/hashing
//! pass with `embedder.rs::index_workspace_vectors`'s batch-embedding loop
//! (progress logging every few batches, CAS-guarded single-flight per
//! collection via `IndexGuard`) into one pipeline instead of two
//! independent full passes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ignore::WalkBuilder;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cache::CacheEntry;
use crate::chunker::{self, Chunk};
use crate::config::CollectionConfig;
use crate::embedding::EmbeddingClient;
use crate::error::{CidxError, CidxResult};
use crate::lang::detect_language;
use crate::projection::{dequantize, quantize, ProjectionMatrix};
use crate::store::{compute_point_id, ChunkType, Point, PointMetadata};

const CHANNEL_CAPACITY: usize = 1000;
const EMBED_BATCH_SIZE: usize = 32;
const PROGRESS_LOG_EVERY: u64 = 5;
const RATE_WINDOW: Duration = Duration::from_secs(30);
/// A batch is considered large enough relative to the collection to warrant
/// a full HNSW rebuild instead of continuing incremental updates.
const REBUILD_BATCH_FRACTION: f32 = 0.3;

struct ChunkJob {
    relpath: String,
    language: &'static str,
    chunk: Chunk,
}

#[derive(Debug, Default, Clone)]
pub struct IndexingSummary {
    pub files_discovered: u64,
    pub files_indexed: u64,
    pub chunks_embedded: u64,
    pub cancelled: bool,
}

/// Tracks a rolling window of (timestamp, count) samples to report a
/// recent throughput rate rather than a lifetime average.
struct RateTracker {
    samples: Mutex<VecDeque<(Instant, u64)>>,
    total: AtomicU64,
}

impl RateTracker {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            total: AtomicU64::new(0),
        }
    }

    fn record(&self, count: u64) {
        self.total.fetch_add(count, Ordering::Relaxed);
        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back((now, count));
        while let Some((t, _)) = samples.front() {
            if now.duration_since(*t) > RATE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate_per_sec(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.len() < 2 {
            return 0.0;
        }
        let span = samples.back().unwrap().0.duration_since(samples.front().unwrap().0).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let total: u64 = samples.iter().map(|(_, c)| c).sum();
        total as f64 / span
    }
}

/// CAS-guarded single-flight indexing per collection, mirroring the
/// teacher's `indexing_workspaces: DashMap<String, Arc<AtomicBool>>` +
/// `IndexGuard` drop-based reset so a panic mid-index still releases the
/// guard.
pub struct Orchestrator {
    in_progress: DashMap<String, Arc<AtomicBool>>,
    embedder: Arc<dyn EmbeddingClient>,
}

struct IndexGuard(Arc<AtomicBool>);
impl Drop for IndexGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Orchestrator {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            in_progress: DashMap::new(),
            embedder,
        }
    }

    pub fn is_indexing(&self, collection: &str) -> bool {
        self.in_progress
            .get(collection)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Re-chunk and re-embed a single file, used by the watch loop instead
    /// of a full `index_collection` pass. Skipped (not queued) if a full
    /// rebuild is already in progress for this collection, matching the
    /// teacher's `reindex_file_vectors` guard against racing a full index.
    pub async fn reindex_file(
        &self,
        project_root: &Path,
        relpath: &str,
        config: &CollectionConfig,
        branch: &str,
        projection: &ProjectionMatrix,
        entry: &Arc<CacheEntry>,
    ) -> CidxResult<()> {
        if self.is_indexing(&entry.collection) {
            tracing::debug!(collection = %entry.collection, relpath, "full index in progress, skipping incremental reindex");
            return Ok(());
        }

        self.remove_file(relpath, entry)?;

        let path = project_root.join(relpath);
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !config.is_extension_indexable(ext) {
            return Ok(());
        }
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(_) => return Ok(()), // file removed between event and read
        };
        if chunker::looks_binary(&bytes) {
            return Ok(());
        }
        let language = detect_language(ext);
        let chunks = chunker::chunk_file(&path.to_string_lossy(), &bytes, language, chunker::DEFAULT_SOFT_CAP_BYTES, chunker::DEFAULT_OVERLAP_LINES)?;
        if chunks.is_empty() {
            return Ok(());
        }

        let jobs: Vec<ChunkJob> = chunks
            .into_iter()
            .map(|chunk| ChunkJob {
                relpath: relpath.to_string(),
                language,
                chunk,
            })
            .collect();

        for batch in jobs.chunks(EMBED_BATCH_SIZE) {
            self.embed_and_upsert(batch, branch, projection, entry).await?;
        }

        // The watch loop never runs a full `index_collection` pass, so this
        // is the only place a long-lived watch session gets a chance to
        // notice the tombstone ratio has crossed the rebuild threshold.
        if entry.try_read_hnsw()?.should_rebuild() {
            self.rebuild_hnsw(entry)?;
        }
        Ok(())
    }

    /// Soft-delete every point indexed from `relpath` across hnsw, store,
    /// and fts. Used both for file deletions and as the first step of a
    /// reindex (remove-then-readd).
    pub fn remove_file(&self, relpath: &str, entry: &Arc<CacheEntry>) -> CidxResult<()> {
        let points = entry.store.scan(|meta| meta.path == relpath)?;
        if points.is_empty() {
            return Ok(());
        }
        {
            let mut hnsw = entry.try_write_hnsw()?;
            for point in &points {
                hnsw.remove(&point.point_id)?;
            }
        }
        {
            let mut fts = entry.fts.lock();
            for point in &points {
                fts.delete_by_point_id(&point.point_id)?;
            }
        }
        for point in &points {
            entry.store.delete(&point.point_id)?;
        }
        Ok(())
    }

    /// Hard-delete points under `relpaths` whose `branch_visibility` has
    /// gone empty — visible on no branch at all, as opposed to merely
    /// invisible on the branch currently being reconciled. Keeps a stale
    /// chunk's footprint in hnsw/fts/store from outliving every branch that
    /// could ever see it, without touching a point another branch still
    /// references.
    fn purge_orphaned_points(&self, relpaths: &[String], entry: &Arc<CacheEntry>) -> CidxResult<()> {
        let paths: std::collections::HashSet<&str> = relpaths.iter().map(|s| s.as_str()).collect();
        let orphans = entry
            .store
            .scan(|meta| paths.contains(meta.path.as_str()) && meta.branch_visibility.is_empty())?;
        if orphans.is_empty() {
            return Ok(());
        }
        {
            let mut hnsw = entry.try_write_hnsw()?;
            for point in &orphans {
                hnsw.remove(&point.point_id)?;
            }
        }
        {
            let mut fts = entry.fts.lock();
            for point in &orphans {
                fts.delete_by_point_id(&point.point_id)?;
            }
        }
        for point in &orphans {
            entry.store.delete(&point.point_id)?;
        }
        Ok(())
    }

    /// Run a full indexing cycle for `project_root` into `entry`'s store,
    /// fts, and hnsw. Returns immediately with a "already indexing" style
    /// no-op if another cycle for this collection is already running.
    pub async fn index_collection(
        &self,
        project_root: &Path,
        config: &CollectionConfig,
        branch: &str,
        projection: &ProjectionMatrix,
        entry: Arc<CacheEntry>,
    ) -> CidxResult<IndexingSummary> {
        let flag = self
            .in_progress
            .entry(entry.collection.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        if flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            tracing::info!(collection = %entry.collection, "indexing already in progress, skipping");
            return Ok(IndexingSummary::default());
        }
        let _guard = IndexGuard(flag);

        self.reconcile_stale_points(project_root, config, branch, &entry)?;

        let (tx, rx) = mpsc::channel::<ChunkJob>(CHANNEL_CAPACITY);
        let files_discovered = Arc::new(AtomicU64::new(0));

        let discovery_root = project_root.to_path_buf();
        let discovery_config = config.clone();
        let discovered_counter = files_discovered.clone();
        let producer = tokio::task::spawn_blocking(move || {
            discover_and_chunk(&discovery_root, &discovery_config, tx, discovered_counter)
        });

        let rate = RateTracker::new();
        let summary = self
            .consume_and_embed(rx, config, branch, projection, &entry, &rate)
            .await?;

        producer
            .await
            .map_err(|e| CidxError::Internal(anyhow::anyhow!("discovery task panicked: {e}")))??;

        entry.flush()?;

        let mut final_summary = summary;
        final_summary.files_discovered = files_discovered.load(Ordering::Relaxed);

        let total_points = entry.try_read_hnsw()?.len();
        let large_batch = total_points > 0 && final_summary.chunks_embedded as f32 / total_points as f32 > REBUILD_BATCH_FRACTION;
        let tombstone_heavy = entry.try_read_hnsw()?.should_rebuild();

        if large_batch || tombstone_heavy {
            self.rebuild_hnsw(&entry)?;
        } else {
            entry.meta.write().stale = false;
        }

        Ok(final_summary)
    }

    /// Reconcile the store against the current file tree before a full
    /// index pass, scoped to `branch` so a reindex on one branch never
    /// destroys another branch's visibility into the same points (C9
    /// "Git-branch visibility" + branch isolation).
    ///
    /// Drops `branch` from the `branch_visibility` set of every point under
    /// a file that's either gone from disk or about to be rediscovered.
    /// Re-embedding then adds `branch` back (via `embed_and_upsert`'s
    /// visibility union) for whatever chunks the current content actually
    /// produces, so a modified file's stale chunks lose visibility on this
    /// branch without ever touching another branch's claim on the same
    /// `point_id`.
    fn reconcile_stale_points(&self, project_root: &Path, config: &CollectionConfig, branch: &str, entry: &Arc<CacheEntry>) -> CidxResult<()> {
        let changes = crate::reconciler::classify_changes(project_root, &std::collections::HashMap::new(), config)?;
        let current_paths: std::collections::HashSet<String> = changes
            .iter()
            .filter_map(|change| match change {
                crate::reconciler::FileChange::Added(path) => {
                    Some(path.strip_prefix(project_root).unwrap_or(path).to_string_lossy().replace('\\', "/"))
                }
                _ => None,
            })
            .collect();

        let stored_paths: std::collections::HashSet<String> =
            entry.store.scan(|_| true)?.into_iter().map(|p| p.metadata.path).collect();

        let deleted: Vec<String> = stored_paths.difference(&current_paths).cloned().collect();
        if !deleted.is_empty() {
            crate::reconciler::reconcile_branch_visibility(entry, branch, &deleted)?;
            self.purge_orphaned_points(&deleted, entry)?;
        }
        let touched: Vec<String> = current_paths.into_iter().collect();
        if !touched.is_empty() {
            crate::reconciler::reconcile_branch_visibility(entry, branch, &touched)?;
            self.purge_orphaned_points(&touched, entry)?;
        }
        Ok(())
    }

    /// Blue-green rebuild the collection's HNSW graph from the vector
    /// store's current contents (soft-deleted points are never persisted
    /// past `remove_file`, so every stored point is by construction live).
    /// Discards and logs a failed shadow build without disturbing the
    /// index currently serving queries.
    fn rebuild_hnsw(&self, entry: &Arc<CacheEntry>) -> CidxResult<()> {
        let live_points: Vec<(crate::store::PointId, Vec<f32>)> = entry
            .store
            .scan(|_| true)?
            .into_iter()
            .map(|p| (p.point_id, dequantize(&p.quantized)))
            .collect();

        let mut hnsw = entry.try_write_hnsw()?;
        match hnsw.rebuild(live_points) {
            Ok(report) => {
                tracing::info!(
                    collection = %entry.collection,
                    vectors = report.vectors_carried_over,
                    reclaimed = report.tombstones_reclaimed,
                    "hnsw blue-green rebuild complete"
                );
                drop(hnsw);
                entry.meta.write().stale = false;
                entry.flush()?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(collection = %entry.collection, error = %e, "hnsw rebuild validation failed, keeping existing index");
                drop(hnsw);
                entry.meta.write().stale = true;
                Ok(())
            }
        }
    }

    async fn consume_and_embed(
        &self,
        mut rx: mpsc::Receiver<ChunkJob>,
        config: &CollectionConfig,
        branch: &str,
        projection: &ProjectionMatrix,
        entry: &Arc<CacheEntry>,
        rate: &RateTracker,
    ) -> CidxResult<IndexingSummary> {
        let mut summary = IndexingSummary::default();
        let mut pending: Vec<ChunkJob> = Vec::with_capacity(EMBED_BATCH_SIZE);
        let mut batches_done: u64 = 0;
        let mut indexed_files = std::collections::HashSet::new();

        loop {
            let job = rx.recv().await;
            match job {
                Some(job) => pending.push(job),
                None => {
                    if !pending.is_empty() {
                        self.embed_and_upsert(&pending, branch, projection, entry).await?;
                        summary.chunks_embedded += pending.len() as u64;
                        rate.record(pending.len() as u64);
                        pending.clear();
                    }
                    break;
                }
            }

            if pending.len() >= EMBED_BATCH_SIZE {
                for job in &pending {
                    indexed_files.insert(job.relpath.clone());
                }
                self.embed_and_upsert(&pending, branch, projection, entry).await?;
                summary.chunks_embedded += pending.len() as u64;
                rate.record(pending.len() as u64);
                pending.clear();

                batches_done += 1;
                if batches_done % PROGRESS_LOG_EVERY == 0 {
                    tracing::info!(
                        collection = %entry.collection,
                        chunks = summary.chunks_embedded,
                        rate_per_sec = rate.rate_per_sec(),
                        "indexing progress"
                    );
                }
            }
        }

        summary.files_indexed = indexed_files.len() as u64;
        Ok(summary)
    }

    async fn embed_and_upsert(
        &self,
        jobs: &[ChunkJob],
        branch: &str,
        projection: &ProjectionMatrix,
        entry: &Arc<CacheEntry>,
    ) -> CidxResult<()> {
        let texts: Vec<String> = jobs.iter().map(|j| j.chunk.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let mut points = Vec::with_capacity(jobs.len());
        let mut hnsw_items = Vec::with_capacity(jobs.len());

        for (job, raw_vector) in jobs.iter().zip(vectors.into_iter()) {
            let projected = projection.apply(&raw_vector)?;
            let quantized = quantize(&projected);
            let point_id = compute_point_id(&job.relpath, job.chunk.start_line, job.chunk.end_line, &job.chunk.text);

            // Identical content chunked the same way hashes to the same
            // point_id regardless of which branch produced it. Union this
            // branch into whatever visibility the point already has instead
            // of replacing it, so indexing branch B never hides a chunk
            // that's still live on branch A.
            let mut branch_visibility = entry
                .store
                .get(&point_id)?
                .map(|existing| existing.metadata.branch_visibility)
                .unwrap_or_default();
            if !branch_visibility.iter().any(|b| b == branch) {
                branch_visibility.push(branch.to_string());
            }

            let metadata = PointMetadata {
                path: job.relpath.clone(),
                language: job.language.to_string(),
                line_start: job.chunk.start_line,
                line_end: job.chunk.end_line,
                chunk_type: ChunkType::Code,
                commit_hash: None,
                author: None,
                timestamp: None,
                branch_visibility,
            };

            points.push(Point {
                point_id: point_id.clone(),
                label: None,
                quantized,
                metadata,
            });
            hnsw_items.push((point_id, projected));
        }

        {
            let mut hnsw = entry.try_write_hnsw()?;
            hnsw.incremental_update(&hnsw_items)?;
            for point in &mut points {
                point.label = hnsw.id_mapping.get(&point.point_id).copied();
            }
        }

        for point in &points {
            entry.store.upsert_point(point)?;
        }

        {
            let mut fts = entry.fts.lock();
            for (job, point) in jobs.iter().zip(points.iter()) {
                fts.upsert_chunk(
                    &point.point_id,
                    &job.relpath,
                    job.language,
                    job.chunk.start_line as u64,
                    job.chunk.end_line as u64,
                    &job.chunk.text,
                    &job.chunk.text,
                )?;
            }
        }

        Ok(())
    }
}

/// Stage A: gitignore-aware file walk, per-file chunking, pushed onto the
/// bounded channel. Runs on a blocking thread since it's dominated by
/// synchronous file IO and CPU-bound chunking.
fn discover_and_chunk(
    root: &Path,
    config: &CollectionConfig,
    tx: mpsc::Sender<ChunkJob>,
    discovered: Arc<AtomicU64>,
) -> CidxResult<()> {
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .filter_entry({
            let exclude_dirs = config.exclude_dirs.clone();
            move |entry| {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    let name = entry.file_name().to_string_lossy().to_string();
                    return !exclude_dirs.contains(&name);
                }
                true
            }
        })
        .build();

    for result in walker {
        let entry = match result {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "walk error, skipping entry");
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        let path: PathBuf = entry.path().to_path_buf();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !config.is_extension_indexable(ext) {
            continue;
        }

        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.len() > config.indexing.max_file_size {
            continue;
        }

        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read file, skipping");
                continue;
            }
        };
        if chunker::looks_binary(&bytes) {
            continue;
        }

        let relpath = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let language = detect_language(ext);

        let chunks = match chunker::chunk_file(&path.to_string_lossy(), &bytes, language, chunker::DEFAULT_SOFT_CAP_BYTES, chunker::DEFAULT_OVERLAP_LINES) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %relpath, error = %e, "failed to chunk file, skipping");
                continue;
            }
        };

        discovered.fetch_add(1, Ordering::Relaxed);
        for chunk in chunks {
            let job = ChunkJob {
                relpath: relpath.clone(),
                language,
                chunk,
            };
            if tx.blocking_send(job).is_err() {
                // Consumer dropped the receiver; treat as cancellation.
                return Ok(());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fts::FtsIndex;
    use crate::hnsw::HnswIndex;
    use crate::projection::Distance;
    use crate::store::{CollectionMeta, VectorStore, CURRENT_SCHEMA_VERSION};

    struct StubEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingClient for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimensions(&self) -> usize {
            4
        }
    }

    fn entry_with_points(dir: &std::path::Path, vectors: &[(&str, [f32; 4])]) -> Arc<CacheEntry> {
        let store = VectorStore::open(dir.to_path_buf()).unwrap();
        let mut hnsw = HnswIndex::new(4, Distance::Cosine, 16, 200, 50).unwrap();
        let fts = FtsIndex::open_or_create(&dir.join("fts")).unwrap();

        let items: Vec<(String, Vec<f32>)> = vectors.iter().map(|(id, v)| (id.to_string(), v.to_vec())).collect();
        hnsw.incremental_update(&items).unwrap();

        for (id, v) in vectors {
            let point = Point {
                point_id: id.to_string(),
                label: hnsw.id_mapping.get(*id).copied(),
                quantized: quantize(v),
                metadata: PointMetadata {
                    path: format!("{id}.rs"),
                    language: "rust".to_string(),
                    line_start: 1,
                    line_end: 2,
                    chunk_type: ChunkType::Code,
                    commit_hash: None,
                    author: None,
                    timestamp: None,
                    branch_visibility: vec!["main".to_string()],
                },
            };
            store.upsert_point(&point).unwrap();
        }

        let meta = CollectionMeta {
            schema_version: CURRENT_SCHEMA_VERSION,
            dim: 4,
            dim_prime: 4,
            distance: Distance::Cosine,
            vector_count: vectors.len(),
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            last_full_build: None,
            stale: false,
            tombstoned_labels: Vec::new(),
        };
        Arc::new(CacheEntry::new("test-collection".to_string(), hnsw, fts, store, meta, Duration::from_secs(600)))
    }

    #[test]
    fn rebuild_hnsw_drops_tombstoned_point_and_clears_stale_flag() {
        let dir = tempfile::tempdir().unwrap();
        let entry = entry_with_points(
            dir.path(),
            &[("p1", [1.0, 0.0, 0.0, 0.0]), ("p2", [0.0, 1.0, 0.0, 0.0])],
        );
        entry.meta.write().stale = true;

        // Soft-delete p1 the way `remove_file` does: tombstone in hnsw, and
        // remove it from the store outright so it is no longer "live".
        {
            let mut hnsw = entry.try_write_hnsw().unwrap();
            hnsw.remove(&"p1".to_string()).unwrap();
        }
        entry.store.delete(&"p1".to_string()).unwrap();

        let embedder: Arc<dyn EmbeddingClient> = Arc::new(StubEmbedder);
        let orchestrator = Orchestrator::new(embedder);
        orchestrator.rebuild_hnsw(&entry).unwrap();

        assert!(!entry.meta.read().stale);
        let hnsw = entry.try_read_hnsw().unwrap();
        assert!(hnsw.tombstones.is_empty());
        assert!(!hnsw.id_mapping.contains_key("p1"));
        assert!(hnsw.id_mapping.contains_key("p2"));
    }

    #[test]
    fn rate_tracker_reports_zero_with_fewer_than_two_samples() {
        let tracker = RateTracker::new();
        assert_eq!(tracker.rate_per_sec(), 0.0);
        tracker.record(10);
        assert_eq!(tracker.rate_per_sec(), 0.0);
    }

    #[test]
    fn rate_tracker_accumulates_total() {
        let tracker = RateTracker::new();
        tracker.record(5);
        tracker.record(7);
        assert_eq!(tracker.total.load(Ordering::Relaxed), 12);
    }
}
