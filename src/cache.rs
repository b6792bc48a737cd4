//! Per-Project Cache (C7): one loaded `(HnswIndex, FtsIndex, VectorStore)`
//! triple per collection, kept warm across queries and evicted after an
//! idle TTL.
//!
//! Generalizes the teacher's `EmbeddingManager.workspaces: DashMap<String,
//! Arc<RwLock<WorkspaceVectorState>>>` pattern (load-on-demand, no TTL) into
//! a first-class cache with explicit eviction — the "scan a map, drop stale
//! entries" shape is the same one `watcher.rs::ReindexCooldownTracker::
//! cleanup_stale` already uses in this codebase.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{CidxError, CidxResult};
use crate::fts::FtsIndex;
use crate::hnsw::HnswIndex;
use crate::store::{CollectionMeta, VectorStore};

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

/// Everything needed to serve a query against one collection, held behind
/// the cache's write/read lock nesting: callers take `hnsw.write()` to
/// mutate (incremental update, rebuild), then `hnsw.read()` to query — never
/// the reverse, and never across an embedding API call.
pub struct CacheEntry {
    pub collection: String,
    pub hnsw: RwLock<HnswIndex>,
    pub fts: Mutex<FtsIndex>,
    pub store: VectorStore,
    pub meta: RwLock<CollectionMeta>,
    last_access: Mutex<Instant>,
    access_count: AtomicU64,
    /// Per-collection idle TTL, sourced from `CollectionConfig.cache.ttl_seconds`
    /// at load time so different collections in the same daemon process can
    /// be tuned independently.
    ttl: Duration,
}

impl CacheEntry {
    pub fn new(collection: String, hnsw: HnswIndex, fts: FtsIndex, store: VectorStore, meta: CollectionMeta, ttl: Duration) -> Self {
        Self {
            collection,
            hnsw: RwLock::new(hnsw),
            fts: Mutex::new(fts),
            store,
            meta: RwLock::new(meta),
            last_access: Mutex::new(Instant::now()),
            access_count: AtomicU64::new(0),
            ttl,
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.idle_for() >= self.ttl
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Persist the in-memory HNSW graph, id mapping, and FTS segments to
    /// disk. Called before eviction and at the end of an indexing cycle.
    ///
    /// Takes `hnsw`'s write lock, not a read lock: per SPEC_FULL.md §4.7,
    /// eviction must not race a query that's mid-`search`, and a shared read
    /// lock held here would let such a query through unserialized. This
    /// follows the same write-lock-then-act discipline as
    /// `Orchestrator::rebuild_hnsw`.
    pub fn flush(&self) -> CidxResult<()> {
        self.fts.lock().commit()?;
        let hnsw = self.try_write_hnsw()?;
        self.store.save_id_mapping(&hnsw.id_mapping)?;
        hnsw.save(&self.store.hnsw_index_path())?;
        let mut meta = self.meta.write();
        meta.vector_count = hnsw.len();
        meta.tombstoned_labels = hnsw.tombstones.iter().copied().collect();
        self.store.save_meta(&meta)?;
        Ok(())
    }

    /// Acquire the write lock within `LOCK_ACQUIRE_TIMEOUT`, surfacing
    /// contention as `CidxError::LockTimeout` instead of blocking forever.
    pub fn try_write_hnsw(&self) -> CidxResult<parking_lot::RwLockWriteGuard<'_, HnswIndex>> {
        self.hnsw
            .try_write_for(LOCK_ACQUIRE_TIMEOUT)
            .ok_or(CidxError::LockTimeout(LOCK_ACQUIRE_TIMEOUT))
    }

    pub fn try_read_hnsw(&self) -> CidxResult<parking_lot::RwLockReadGuard<'_, HnswIndex>> {
        self.hnsw
            .try_read_for(LOCK_ACQUIRE_TIMEOUT)
            .ok_or(CidxError::LockTimeout(LOCK_ACQUIRE_TIMEOUT))
    }
}

pub struct ProjectCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    pub stats: CacheStats,
}

impl ProjectCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, collection: &str) -> Option<Arc<CacheEntry>> {
        match self.entries.get(collection) {
            Some(entry) => {
                entry.touch();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a freshly loaded entry, replacing and flushing any previous
    /// one for the same collection name.
    pub fn insert(&self, entry: CacheEntry) -> CidxResult<Arc<CacheEntry>> {
        let collection = entry.collection.clone();
        let entry = Arc::new(entry);
        if let Some((_, old)) = self.entries.remove(&collection) {
            old.flush()?;
        }
        self.entries.insert(collection, entry.clone());
        Ok(entry)
    }

    pub fn clear(&self, collection: &str) -> CidxResult<()> {
        if let Some((_, entry)) = self.entries.remove(collection) {
            entry.flush()?;
        }
        Ok(())
    }

    pub fn clear_all(&self) -> CidxResult<()> {
        for entry in self.entries.iter() {
            entry.flush()?;
        }
        self.entries.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict every entry idle longer than the configured TTL, flushing each
    /// one to disk first. Returns the number of entries evicted.
    pub fn evict_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired())
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for collection in expired {
            if let Some((_, entry)) = self.entries.remove(&collection) {
                if let Err(e) = entry.flush() {
                    tracing::warn!(collection, error = %e, "failed to flush cache entry on eviction");
                }
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Spawn the background TTL-eviction sweep. Returns the task handle so the
/// daemon can abort it on shutdown.
pub fn spawn_eviction_task(cache: Arc<ProjectCache>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::info!(evicted, "evicted idle cache entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::Distance;
    use crate::store::CURRENT_SCHEMA_VERSION;

    fn sample_entry(dir: &std::path::Path, collection: &str, ttl: Duration) -> CacheEntry {
        let store = VectorStore::open(dir.to_path_buf()).unwrap();
        let hnsw = HnswIndex::new(4, Distance::Cosine, 16, 200, 50).unwrap();
        let fts = FtsIndex::open_or_create(&dir.join("fts")).unwrap();
        let meta = CollectionMeta {
            schema_version: CURRENT_SCHEMA_VERSION,
            dim: 4,
            dim_prime: 4,
            distance: Distance::Cosine,
            vector_count: 0,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            last_full_build: None,
            stale: false,
            tombstoned_labels: Vec::new(),
        };
        CacheEntry::new(collection.to_string(), hnsw, fts, store, meta, ttl)
    }

    #[test]
    fn get_on_empty_cache_is_a_miss() {
        let cache = ProjectCache::new();
        assert!(cache.get("nope").is_none());
        assert_eq!(cache.stats.misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn insert_then_get_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProjectCache::new();
        cache.insert(sample_entry(dir.path(), "proj", Duration::from_secs(600))).unwrap();
        assert!(cache.get("proj").is_some());
        assert_eq!(cache.stats.hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn evict_expired_removes_idle_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProjectCache::new();
        cache.insert(sample_entry(dir.path(), "proj", Duration::from_millis(1))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let evicted = cache.evict_expired();
        assert_eq!(evicted, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_flushes_and_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProjectCache::new();
        cache.insert(sample_entry(dir.path(), "proj", Duration::from_secs(600))).unwrap();
        cache.clear("proj").unwrap();
        assert!(cache.is_empty());
    }
}
