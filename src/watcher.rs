//! Watch Loop (C10): debounced file-system events driving incremental
//! (never full-rebuild) updates to a collection's HNSW/FTS/store trio.
//!
//! Kept nearly as-is from the teacher's `watcher.rs` — the debouncer setup,
//! `ReindexCooldownTracker`, periodic stale-entry cleanup, and build/output
//! directory skip are all the same shape — with the reindex target changed
//! from Tantivy-only (`IndexManager::reindex_file`) to the full
//! chunk→embed→project→quantize→upsert incremental path via
//! `Orchestrator::reindex_file`/`remove_file`. The cache entry is updated
//! in place; daemon mode never invalidates it (SPEC_FULL.md §4.10).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::CacheEntry;
use crate::config::CollectionConfig;
use crate::orchestrator::Orchestrator;
use crate::projection::ProjectionMatrix;
use crate::reconciler::current_branch;

/// Minimum interval between re-index operations for the same file.
/// Prevents rapid saves from triggering redundant re-indexing.
const REINDEX_COOLDOWN_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub enum WatchEvent {
    FileChanged {
        collection: String,
        path: String,
        change_type: &'static str,
    },
}

pub struct FileWatcherManager {
    watchers: DashMap<String, WatcherHandle>,
    event_tx: broadcast::Sender<WatchEvent>,
}

struct WatcherHandle {
    _watcher: notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>,
}

struct ReindexCooldownTracker {
    last_reindex: HashMap<String, Instant>,
}

impl ReindexCooldownTracker {
    fn new() -> Self {
        Self {
            last_reindex: HashMap::new(),
        }
    }

    fn should_reindex(&mut self, path: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_reindex.get(path) {
            if now.duration_since(*last) < Duration::from_millis(REINDEX_COOLDOWN_MS) {
                return false;
            }
        }
        self.last_reindex.insert(path.to_string(), now);
        true
    }

    fn cleanup_stale(&mut self) {
        let cutoff = Instant::now() - Duration::from_secs(60);
        self.last_reindex.retain(|_, v| *v > cutoff);
    }
}

/// Everything a watch loop needs to act on a file-change event for one
/// collection, bundled so the debouncer's callback closure doesn't need a
/// dozen captured variables.
#[derive(Clone)]
pub struct WatchContext {
    pub project_root: PathBuf,
    pub config: Arc<CollectionConfig>,
    pub projection: Arc<ProjectionMatrix>,
    pub orchestrator: Arc<Orchestrator>,
    pub entry: Arc<CacheEntry>,
}

impl FileWatcherManager {
    pub fn new(channel_capacity: usize) -> (Self, broadcast::Receiver<WatchEvent>) {
        let (event_tx, rx) = broadcast::channel(channel_capacity);
        (
            Self {
                watchers: DashMap::new(),
                event_tx,
            },
            rx,
        )
    }

    pub fn start_watching(&self, collection: &str, ctx: WatchContext) -> Result<(), notify::Error> {
        if self.watchers.contains_key(collection) {
            return Ok(());
        }

        let collection_id = collection.to_string();
        let event_tx = self.event_tx.clone();
        let watch_path = ctx.project_root.clone();
        let cooldown = Arc::new(Mutex::new(ReindexCooldownTracker::new()));
        let cleanup_counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let rt_handle = tokio::runtime::Handle::try_current().ok();
        let debounce = Duration::from_secs_f64(ctx.config.watch.debounce_seconds);

        let mut debouncer = new_debouncer(
            debounce,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let count = cleanup_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if count % 50 == 0 {
                        cooldown.lock().cleanup_stale();
                    }

                    let mut file_events: HashMap<PathBuf, &'static str> = HashMap::new();
                    for event in &events {
                        let change_type = classify_debounced_event(event);
                        if change_type == "access" || change_type == "other" {
                            continue;
                        }
                        for path in &event.paths {
                            if is_excluded(path, &ctx.config.exclude_dirs) {
                                continue;
                            }
                            file_events.insert(path.clone(), change_type);
                        }
                    }

                    for (path, change_type) in file_events {
                        let relative = path
                            .strip_prefix(&watch_path)
                            .unwrap_or(&path)
                            .to_string_lossy()
                            .replace('\\', "/");

                        if !cooldown.lock().should_reindex(&relative) {
                            continue;
                        }

                        let _ = event_tx.send(WatchEvent::FileChanged {
                            collection: collection_id.clone(),
                            path: relative.clone(),
                            change_type,
                        });

                        if let Some(handle) = &rt_handle {
                            let ctx = ctx.clone();
                            let relative = relative.clone();
                            handle.spawn(async move {
                                let result = if change_type == "remove" {
                                    ctx.orchestrator.remove_file(&relative, &ctx.entry)
                                } else {
                                    let branch = current_branch(&ctx.project_root).unwrap_or_else(|_| "main".to_string());
                                    ctx.orchestrator
                                        .reindex_file(&ctx.project_root, &relative, &ctx.config, &branch, &ctx.projection, &ctx.entry)
                                        .await
                                };
                                if let Err(e) = result {
                                    tracing::debug!(path = %relative, error = %e, "incremental reindex skipped");
                                }
                            });
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!("file watcher error: {:?}", e);
                    }
                }
            },
        )?;

        debouncer
            .watch(ctx.project_root.as_path(), RecursiveMode::Recursive)
            .map_err(|e| notify::Error::generic(&format!("watch failed: {e}")))?;

        self.watchers.insert(collection.to_string(), WatcherHandle { _watcher: debouncer });
        info!(collection, debounce_ms = debounce.as_millis() as u64, "started watching collection");
        Ok(())
    }

    pub fn stop_watching(&self, collection: &str) {
        if self.watchers.remove(collection).is_some() {
            info!(collection, "stopped watching collection");
        }
    }

    pub fn is_watching(&self, collection: &str) -> bool {
        self.watchers.contains_key(collection)
    }
}

fn is_excluded(path: &std::path::Path, exclude_dirs: &[String]) -> bool {
    path.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        exclude_dirs.iter().any(|d| d == name.as_ref())
    })
}

fn classify_debounced_event(event: &DebouncedEvent) -> &'static str {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => "create",
        EventKind::Modify(_) => "modify",
        EventKind::Remove(_) => "remove",
        EventKind::Access(_) => "access",
        _ => "other",
    }
}
