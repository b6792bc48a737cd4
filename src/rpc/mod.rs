//! Daemon RPC (C12): the single process that owns the per-collection cache
//! and exposes query/index/watch/status/clear_cache over a Unix domain
//! socket.
//!
//! The accept loop, semaphore-bounded worker pool, and "bind and start
//! serving before restoring any watch state" ordering are grounded on the
//! teacher's `main.rs` startup sequence; the non-blocking `status` snapshot
//! and graceful-shutdown notify pattern are grounded on `routes/health.rs`'s
//! `OnceLock<Instant>` uptime tracker and `OnceLock<Arc<Notify>>` shutdown
//! signal, adapted here to live on an owned `Daemon` struct instead of a
//! process-global `OnceLock` since this architecture has no axum `State`
//! extractor to thread it through.

pub mod protocol;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, Semaphore};
use tracing::Instrument;

use crate::cache::{CacheEntry, ProjectCache};
use crate::config::{load_collection_config, CollectionConfig, DaemonConfig};
use crate::embedding::EmbeddingClient;
use crate::error::{CidxError, CidxResult};
use crate::fts::FtsIndex;
use crate::hnsw::HnswIndex;
use crate::orchestrator::Orchestrator;
use crate::projection::ProjectionMatrix;
use crate::query::{self, FtsOptions, QueryFilters, TemporalFilters};
use crate::reconciler::current_branch;
use crate::store::{CollectionMeta, VectorStore, CURRENT_SCHEMA_VERSION};
use crate::watcher::{FileWatcherManager, WatchContext};

use protocol::{read_request, write_response, RpcResponse};

const MAX_CONCURRENT_REQUESTS: usize = 16;

pub struct Daemon {
    pub daemon_config: DaemonConfig,
    pub cache: Arc<ProjectCache>,
    pub orchestrator: Arc<Orchestrator>,
    pub watchers: Arc<FileWatcherManager>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub start_time: Instant,
    pub shutdown: Arc<Notify>,
    requests_served: AtomicU64,
    /// Projection matrices are immutable for the life of a collection (C3
    /// invariant), so they're cached alongside the HNSW/FTS/store trio
    /// instead of being re-read from `projection.bin` on every request.
    projections: DashMap<String, Arc<ProjectionMatrix>>,
}

fn runtime_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cidx")
}

pub fn socket_path() -> PathBuf {
    runtime_dir().join("daemon.sock")
}

pub fn pid_path() -> PathBuf {
    runtime_dir().join("daemon.pid")
}

/// Write the current process's PID atomically, after checking for and
/// removing a stale PID file from a process that is no longer running.
pub fn claim_pid_file() -> CidxResult<()> {
    let dir = runtime_dir();
    std::fs::create_dir_all(&dir)?;
    let path = pid_path();

    if let Ok(existing) = std::fs::read_to_string(&path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if process_is_alive(pid) {
                return Err(CidxError::Config(format!(
                    "daemon already running with pid {pid} ({})",
                    path.display()
                )));
            }
            tracing::warn!(pid, "removing stale pid file");
        }
    }

    crate::store::atomic_write(&path, std::process::id().to_string().as_bytes())
}

pub fn release_pid_file() {
    let _ = std::fs::remove_file(pid_path());
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    // Conservative default on non-Linux targets: assume alive so a stale
    // file from a crash requires explicit operator cleanup rather than
    // risking two daemons on the same socket.
    true
}

impl Daemon {
    pub fn new(daemon_config: DaemonConfig, embedder: Arc<dyn EmbeddingClient>) -> Self {
        let (watchers, _watch_events) = FileWatcherManager::new(1024);
        Self {
            daemon_config,
            cache: Arc::new(ProjectCache::new()),
            orchestrator: Arc::new(Orchestrator::new(embedder.clone())),
            watchers: Arc::new(watchers),
            embedder,
            start_time: Instant::now(),
            shutdown: Arc::new(Notify::new()),
            requests_served: AtomicU64::new(0),
            projections: DashMap::new(),
        }
    }

    /// Bind the socket and serve connections until shutdown is signalled.
    /// Binds and starts accepting *before* anything else runs, mirroring
    /// the teacher's "serve first, restore state after" ordering.
    pub async fn serve(self: Arc<Self>) -> CidxResult<()> {
        let path = socket_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        std::fs::create_dir_all(path.parent().unwrap())?;
        let listener = UnixListener::bind(&path)
            .map_err(|e| CidxError::Io(std::io::Error::other(format!("binding {}: {e}", path.display()))))?;

        claim_pid_file()?;
        tracing::info!(socket = %path.display(), "daemon listening");

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS));
        let eviction_task = crate::cache::spawn_eviction_task(self.cache.clone());

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("shutdown signal received, draining connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed");
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = daemon.handle_connection(stream).await {
                            tracing::debug!(error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        eviction_task.abort();
        self.cache.clear_all()?;
        release_pid_file();
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, mut stream: UnixStream) -> CidxResult<()> {
        loop {
            let request = match read_request(&mut stream).await? {
                Some(r) => r,
                None => return Ok(()),
            };
            self.requests_served.fetch_add(1, Ordering::Relaxed);

            let span = tracing::info_span!("rpc", method = %request.method, correlation_id = %request.id);
            let outcome = self
                .dispatch(&request.method, request.params)
                .instrument(span)
                .await;

            let response = match outcome {
                Ok(result) => RpcResponse::ok(request.id.clone(), result),
                Err(e) => {
                    if e.is_server_fault() {
                        tracing::error!(error = %e, "rpc request failed");
                    } else {
                        tracing::warn!(error = %e, "rpc request rejected");
                    }
                    RpcResponse::err(request.id.clone(), &e)
                }
            };

            write_response(&mut stream, &response).await?;
        }
    }

    async fn dispatch(&self, method: &str, params: serde_json::Value) -> CidxResult<serde_json::Value> {
        match method {
            "query" => self.handle_query(params).await,
            "index" => self.handle_index(params).await,
            "watch_start" => self.handle_watch_start(params).await,
            "watch_stop" => self.handle_watch_stop(params).await,
            "status" => self.handle_status(params),
            "clear_cache" => self.handle_clear_cache(params),
            other => Err(CidxError::BadInput(format!("unknown rpc method: {other}"))),
        }
    }

    /// Load (or fetch from cache) the `CacheEntry`, config, and projection
    /// matrix for a project root. The glue tying C4/C5/C6/C7/A1 together for
    /// a cold collection has no single teacher counterpart; it generalizes
    /// the construction order the teacher's `get_or_create_workspace`
    /// follows (config → store → index → cache insert).
    fn open_collection(&self, project_root: &Path) -> CidxResult<(Arc<CacheEntry>, Arc<CollectionConfig>, Arc<ProjectionMatrix>)> {
        let canonical = dunce::canonicalize(project_root).unwrap_or_else(|_| project_root.to_path_buf());
        let collection = canonical.to_string_lossy().to_string();
        let config = Arc::new(load_collection_config(project_root)?);

        if let Some(entry) = self.cache.get(&collection) {
            let projection = self.cached_projection(&collection, &entry)?;
            return Ok((entry, config, projection));
        }

        let index_root = self.daemon_config.collection_root(project_root).join("index");
        let store = VectorStore::open(index_root.clone())?;

        let meta = match store.load_meta()? {
            Some(meta) => meta,
            None => CollectionMeta {
                schema_version: CURRENT_SCHEMA_VERSION,
                dim: config.embedding.dimensions,
                dim_prime: config.embedding.dimensions,
                distance: crate::projection::Distance::Cosine,
                vector_count: 0,
                hnsw_m: config.hnsw.m,
                hnsw_ef_construction: config.hnsw.ef_construction,
                last_full_build: None,
                stale: false,
                tombstoned_labels: Vec::new(),
            },
        };
        store.save_meta(&meta)?;

        let projection = if store.projection_path().exists() {
            let bytes = std::fs::read(store.projection_path())?;
            ProjectionMatrix::from_bytes(&bytes, meta.dim, meta.dim_prime)?
        } else {
            let matrix = ProjectionMatrix::fit(&collection, meta.dim, meta.dim_prime);
            crate::store::atomic_write(&store.projection_path(), &matrix.to_bytes())?;
            matrix
        };
        let projection = Arc::new(projection);
        self.projections.insert(collection.clone(), projection.clone());

        let id_mapping = store.load_id_mapping()?;
        let tombstones: std::collections::HashSet<u32> = meta.tombstoned_labels.iter().copied().collect();
        let hnsw = if store.hnsw_index_path().exists() {
            HnswIndex::load(
                &store.hnsw_index_path(),
                meta.dim_prime,
                meta.distance,
                meta.hnsw_m,
                meta.hnsw_ef_construction,
                config.hnsw.ef_search,
                id_mapping,
                tombstones,
            )?
        } else {
            let mut fresh = HnswIndex::new(meta.dim_prime, meta.distance, meta.hnsw_m, meta.hnsw_ef_construction, config.hnsw.ef_search)?;
            fresh.id_mapping = id_mapping;
            fresh.tombstones = tombstones;
            fresh
        };

        let fts = FtsIndex::open_or_create(&index_root.join("fts"))?;
        let ttl = std::time::Duration::from_secs(config.cache.ttl_seconds);
        let entry = self.cache.insert(CacheEntry::new(collection, hnsw, fts, store, meta, ttl))?;
        Ok((entry, config, projection))
    }

    /// Return the cached projection matrix for a collection whose
    /// `CacheEntry` is already loaded, reading `projection.bin` only once
    /// per process lifetime per collection.
    fn cached_projection(&self, collection: &str, entry: &CacheEntry) -> CidxResult<Arc<ProjectionMatrix>> {
        if let Some(cached) = self.projections.get(collection) {
            return Ok(cached.clone());
        }
        let meta = entry.meta.read().clone();
        let bytes = std::fs::read(entry.store.projection_path())?;
        let matrix = Arc::new(ProjectionMatrix::from_bytes(&bytes, meta.dim, meta.dim_prime)?);
        self.projections.insert(collection.to_string(), matrix.clone());
        Ok(matrix)
    }

    async fn handle_query(&self, params: serde_json::Value) -> CidxResult<serde_json::Value> {
        #[derive(Deserialize)]
        struct QueryParams {
            project_root: PathBuf,
            kind: String,
            text: String,
            #[serde(default = "default_k")]
            k: usize,
            #[serde(default)]
            language: Option<String>,
            #[serde(default)]
            path_filter: Option<String>,
            #[serde(default)]
            exclude_path: Option<String>,
            #[serde(default)]
            min_score: Option<f32>,
            #[serde(default)]
            case_sensitive: bool,
            #[serde(default)]
            fuzzy: bool,
            #[serde(default = "default_edit_distance")]
            edit_distance: u8,
            #[serde(default)]
            regex: bool,
        }
        fn default_k() -> usize {
            10
        }
        fn default_edit_distance() -> u8 {
            2
        }

        let p: QueryParams = serde_json::from_value(params)
            .map_err(|e| CidxError::BadInput(format!("invalid query params: {e}")))?;

        let (entry, _config, projection) = self.open_collection(&p.project_root)?;
        let branch = current_branch(&p.project_root).unwrap_or_else(|_| "main".to_string());

        let semantic_filters = QueryFilters {
            language: p.language.clone(),
            path_filter: p.path_filter.clone(),
            exclude_path: p.exclude_path.clone(),
            min_score: p.min_score,
        };
        let fts_options = FtsOptions {
            case_sensitive: p.case_sensitive,
            fuzzy: p.fuzzy,
            edit_distance: p.edit_distance,
            regex: p.regex,
            language: p.language,
            path_filter: p.path_filter,
            exclude_path: p.exclude_path,
            ..Default::default()
        };

        let hits = match p.kind.as_str() {
            "semantic" => query::query_semantic(&p.project_root, &entry, self.embedder.as_ref(), &projection, &branch, &p.text, p.k, &semantic_filters).await?,
            "fts" => query::query_fts(&entry, &p.text, p.k, &fts_options)?,
            "hybrid" => {
                query::query_hybrid(&p.project_root, &entry, self.embedder.as_ref(), &projection, &branch, &p.text, p.k, &semantic_filters, &fts_options).await?
            }
            "temporal" => {
                query::query_temporal(&p.project_root, &entry, self.embedder.as_ref(), &projection, &branch, &p.text, p.k, &semantic_filters, &TemporalFilters::default()).await?
            }
            other => return Err(CidxError::BadInput(format!("unknown query kind: {other}"))),
        };

        Ok(json!({ "hits": hits.iter().map(|h| json!({
            "path": h.path,
            "line_start": h.line_start,
            "line_end": h.line_end,
            "language": h.language,
            "score": h.score,
            "content": h.content,
        })).collect::<Vec<_>>() }))
    }

    async fn handle_index(&self, params: serde_json::Value) -> CidxResult<serde_json::Value> {
        #[derive(Deserialize)]
        struct IndexParams {
            project_root: PathBuf,
        }
        let p: IndexParams = serde_json::from_value(params)
            .map_err(|e| CidxError::BadInput(format!("invalid index params: {e}")))?;

        let (entry, config, projection) = self.open_collection(&p.project_root)?;
        let branch = current_branch(&p.project_root).unwrap_or_else(|_| "main".to_string());

        let summary = self
            .orchestrator
            .index_collection(&p.project_root, &config, &branch, &projection, entry)
            .await?;

        Ok(json!({
            "files_discovered": summary.files_discovered,
            "files_indexed": summary.files_indexed,
            "chunks_embedded": summary.chunks_embedded,
            "cancelled": summary.cancelled,
        }))
    }

    async fn handle_watch_start(&self, params: serde_json::Value) -> CidxResult<serde_json::Value> {
        #[derive(Deserialize)]
        struct WatchParams {
            project_root: PathBuf,
        }
        let p: WatchParams = serde_json::from_value(params)
            .map_err(|e| CidxError::BadInput(format!("invalid watch params: {e}")))?;

        let (entry, config, projection) = self.open_collection(&p.project_root)?;
        let collection = entry.collection.clone();
        let ctx = WatchContext {
            project_root: p.project_root.clone(),
            config,
            projection,
            orchestrator: self.orchestrator.clone(),
            entry,
        };
        self.watchers
            .start_watching(&collection, ctx)
            .map_err(|e| CidxError::Internal(anyhow::anyhow!("failed to start watcher: {e}")))?;

        Ok(json!({ "watching": true }))
    }

    async fn handle_watch_stop(&self, params: serde_json::Value) -> CidxResult<serde_json::Value> {
        #[derive(Deserialize)]
        struct WatchParams {
            project_root: PathBuf,
        }
        let p: WatchParams = serde_json::from_value(params)
            .map_err(|e| CidxError::BadInput(format!("invalid watch params: {e}")))?;
        let canonical = dunce::canonicalize(&p.project_root).unwrap_or(p.project_root);
        let collection = canonical.to_string_lossy().to_string();
        self.watchers.stop_watching(&collection);
        Ok(json!({ "watching": false }))
    }

    fn handle_status(&self, params: serde_json::Value) -> CidxResult<serde_json::Value> {
        #[derive(Deserialize, Default)]
        struct StatusParams {
            #[serde(default)]
            project_root: Option<PathBuf>,
        }
        let p: StatusParams = serde_json::from_value(params).unwrap_or_default();

        let base = json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "requests_served": self.requests_served.load(Ordering::Relaxed),
            "cache_entries": self.cache.len(),
            "cache_hits": self.cache.stats.hits.load(Ordering::Relaxed),
            "cache_misses": self.cache.stats.misses.load(Ordering::Relaxed),
            "cache_evictions": self.cache.stats.evictions.load(Ordering::Relaxed),
        });

        if let Some(project_root) = p.project_root {
            let canonical = dunce::canonicalize(&project_root).unwrap_or(project_root);
            let collection = canonical.to_string_lossy().to_string();
            if let Some(entry) = self.cache.get(&collection) {
                let mut value = base;
                value["collection"] = json!({
                    "name": collection,
                    "access_count": entry.access_count(),
                    "idle_seconds": entry.idle_for().as_secs(),
                    "vector_count": entry.meta.read().vector_count,
                    "indexing_in_progress": self.orchestrator.is_indexing(&collection),
                    "watching": self.watchers.is_watching(&collection),
                });
                return Ok(value);
            }
        }

        Ok(base)
    }

    fn handle_clear_cache(&self, params: serde_json::Value) -> CidxResult<serde_json::Value> {
        #[derive(Deserialize, Default)]
        struct ClearParams {
            #[serde(default)]
            project_root: Option<PathBuf>,
        }
        let p: ClearParams = serde_json::from_value(params).unwrap_or_default();

        match p.project_root {
            Some(project_root) => {
                let canonical = dunce::canonicalize(&project_root).unwrap_or(project_root);
                let collection = canonical.to_string_lossy().to_string();
                self.cache.clear(&collection)?;
            }
            None => self.cache.clear_all()?,
        }
        Ok(json!({ "cleared": true }))
    }
}
