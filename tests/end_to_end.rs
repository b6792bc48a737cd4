//! Cross-component scenarios driving the orchestrator, query engine, cache,
//! and watch-loop helpers directly against a `tempfile::tempdir()`-rooted
//! collection, the way `Daemon::open_collection` wires them together
//! internally (its RPC-handling methods are private, so these tests build
//! the same component graph by hand instead of going through the socket).
//!
//! `HashEmbeddingClient` stands in for the real Voyage AI client: it maps
//! text to a vector deterministically via SHA-256 so a query for the exact
//! text that was indexed always finds itself, with no network I/O and no
//! run-to-run flakiness.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cidx::cache::{CacheEntry, ProjectCache};
use cidx::config::CollectionConfig;
use cidx::embedding::EmbeddingClient;
use cidx::error::CidxResult;
use cidx::fts::FtsIndex;
use cidx::hnsw::HnswIndex;
use cidx::orchestrator::Orchestrator;
use cidx::projection::{Distance, ProjectionMatrix};
use cidx::query::{self, FtsOptions, QueryFilters};
use cidx::store::{compute_point_id, CollectionMeta, VectorStore, CURRENT_SCHEMA_VERSION};

const EMBED_DIM: usize = 16;
const PROJECTED_DIM: usize = 8;

struct HashEmbeddingClient;

#[async_trait::async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> CidxResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        EMBED_DIM
    }
}

fn hash_vector(text: &str) -> Vec<f32> {
    use sha2::{Digest, Sha256};
    let mut out = Vec::with_capacity(EMBED_DIM);
    let mut counter = 0u32;
    while out.len() < EMBED_DIM {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();
        for chunk in digest.chunks_exact(4) {
            if out.len() >= EMBED_DIM {
                break;
            }
            let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            out.push((bits as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        counter += 1;
    }
    out
}

/// Build the same `(VectorStore, HnswIndex, FtsIndex, CacheEntry,
/// ProjectionMatrix)` graph `Daemon::open_collection` assembles for a cold
/// collection, rooted under `index_root` rather than `<project>/.cidx`.
fn build_entry(index_root: &Path, collection: &str, config: &CollectionConfig, ttl: Duration) -> (CacheEntry, ProjectionMatrix) {
    let store = VectorStore::open(index_root.to_path_buf()).unwrap();
    let projection = ProjectionMatrix::fit(collection, EMBED_DIM, PROJECTED_DIM);
    let hnsw = HnswIndex::new(PROJECTED_DIM, Distance::Cosine, config.hnsw.m, config.hnsw.ef_construction, config.hnsw.ef_search).unwrap();
    let fts = FtsIndex::open_or_create(&index_root.join("fts")).unwrap();
    let meta = CollectionMeta {
        schema_version: CURRENT_SCHEMA_VERSION,
        dim: EMBED_DIM,
        dim_prime: PROJECTED_DIM,
        distance: Distance::Cosine,
        vector_count: 0,
        hnsw_m: config.hnsw.m,
        hnsw_ef_construction: config.hnsw.ef_construction,
        last_full_build: None,
        stale: false,
        tombstoned_labels: Vec::new(),
    };
    let entry = CacheEntry::new(collection.to_string(), hnsw, fts, store, meta, ttl);
    (entry, projection)
}

fn open_collection(index_root: &Path, collection: &str, config: &CollectionConfig, ttl: Duration) -> (Arc<CacheEntry>, ProjectionMatrix) {
    let (entry, projection) = build_entry(index_root, collection, config, ttl);
    (Arc::new(entry), projection)
}

fn orchestrator() -> Arc<Orchestrator> {
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient);
    Arc::new(Orchestrator::new(embedder))
}

/// Scenario: minimal index + query. A single indexable file is discovered,
/// chunked, embedded, and projected into the collection; a semantic query
/// for the exact indexed text resolves back to it.
#[tokio::test]
async fn minimal_index_and_query_round_trips_a_chunk() {
    let project = tempfile::tempdir().unwrap();
    let index_root = tempfile::tempdir().unwrap();
    let relpath = "src/add.py";
    let content = "def add(a, b):\n    return a + b\n";
    std::fs::create_dir_all(project.path().join("src")).unwrap();
    std::fs::write(project.path().join(relpath), content).unwrap();

    let config = CollectionConfig::default();
    let (entry, projection) = open_collection(index_root.path(), "minimal", &config, Duration::from_secs(600));
    let orchestrator = orchestrator();
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient);

    let summary = orchestrator.index_collection(project.path(), &config, "main", &projection, entry.clone()).await.unwrap();
    assert_eq!(summary.files_discovered, 1);
    assert!(summary.chunks_embedded >= 1);

    let hits = query::query_semantic(project.path(), &entry, embedder.as_ref(), &projection, "main", content, 5, &QueryFilters::default())
        .await
        .unwrap();

    assert!(!hits.is_empty());
    assert_eq!(hits[0].path, relpath);
    assert_eq!(hits[0].language, "python");
}

/// Scenario: reconcile-via-mtime. Re-indexing after a file's content
/// changes purges the stale chunk (its point becomes invisible on every
/// branch, since it was only ever indexed on one) and leaves the new
/// content's chunk in its place, without accumulating duplicates.
#[tokio::test]
async fn reconcile_detects_modified_file_and_drops_stale_chunk() {
    let project = tempfile::tempdir().unwrap();
    let index_root = tempfile::tempdir().unwrap();
    let relpath = "lib.py";
    let original = "value = 1\n";
    std::fs::write(project.path().join(relpath), original).unwrap();

    let config = CollectionConfig::default();
    let (entry, projection) = open_collection(index_root.path(), "reconcile", &config, Duration::from_secs(600));
    let orchestrator = orchestrator();

    orchestrator.index_collection(project.path(), &config, "main", &projection, entry.clone()).await.unwrap();
    // `chunk_text` joins lines without a trailing newline, so the chunk's
    // own text (and therefore its point_id) drops the one `original` ends with.
    let original_point_id = compute_point_id(relpath, 1, 1, original.trim_end_matches('\n'));
    assert!(entry.store.get(&original_point_id).unwrap().is_some());

    let modified = "value = 2\n";
    std::fs::write(project.path().join(relpath), modified).unwrap();
    orchestrator.index_collection(project.path(), &config, "main", &projection, entry.clone()).await.unwrap();

    assert!(entry.store.get(&original_point_id).unwrap().is_none(), "stale chunk from the old content should be purged");
    let live = entry.store.scan(|meta| meta.path == relpath).unwrap();
    assert_eq!(live.len(), 1, "re-indexing an unchanged file count should not accumulate duplicate chunks");
    assert_eq!(live[0].point_id, compute_point_id(relpath, 1, 1, modified.trim_end_matches('\n')));
}

/// Scenario: watch-mode incremental update. `reindex_file` (the path the
/// debounced watcher drives) updates the live in-memory hnsw/store/fts
/// directly, so a query issued immediately afterward — no flush, no
/// reload — already reflects the new content.
#[tokio::test]
async fn watch_mode_reindex_is_visible_to_queries_with_no_delay() {
    let project = tempfile::tempdir().unwrap();
    let index_root = tempfile::tempdir().unwrap();
    let relpath = "watched.py";
    let original = "def ping():\n    return 'pong'\n";
    std::fs::write(project.path().join(relpath), original).unwrap();

    let config = CollectionConfig::default();
    let (entry, projection) = open_collection(index_root.path(), "watch", &config, Duration::from_secs(600));
    let orchestrator = orchestrator();
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient);

    orchestrator.index_collection(project.path(), &config, "main", &projection, entry.clone()).await.unwrap();

    let updated = "def ping():\n    return 'updated'\n";
    std::fs::write(project.path().join(relpath), updated).unwrap();
    orchestrator
        .reindex_file(project.path(), relpath, &config, "main", &projection, &entry)
        .await
        .unwrap();

    let hits = query::query_semantic(project.path(), &entry, embedder.as_ref(), &projection, "main", updated, 5, &QueryFilters::default())
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.path == relpath));

    let stale_point_id = compute_point_id(relpath, 1, 2, original.trim_end_matches('\n'));
    assert!(entry.store.get(&stale_point_id).unwrap().is_none(), "reindex_file must remove the old file's points before re-adding");
}

/// Scenario: FTS regex and exact query modes against the same indexed
/// content, and the documented mutual exclusivity of `regex` and `fuzzy`.
#[tokio::test]
async fn fts_supports_exact_and_regex_modes() {
    let project = tempfile::tempdir().unwrap();
    let index_root = tempfile::tempdir().unwrap();
    let relpath = "search_me.py";
    // A single alphanumeric token (no underscores) survives the identifiers
    // field's default tokenizer as one term, matching how `token_regex_matches_identifiers`
    // in `fts.rs` exercises `TokenRegex` against a camelCase identifier.
    let content = "def handler():\n    return needletoken42\n";
    std::fs::write(project.path().join(relpath), content).unwrap();

    let config = CollectionConfig::default();
    let (entry, projection) = open_collection(index_root.path(), "fts", &config, Duration::from_secs(600));
    let orchestrator = orchestrator();

    orchestrator.index_collection(project.path(), &config, "main", &projection, entry.clone()).await.unwrap();

    let exact = query::query_fts(&entry, "needletoken42", 10, &FtsOptions::default()).unwrap();
    assert!(exact.iter().any(|h| h.path == relpath));

    let regex_opts = FtsOptions {
        regex: true,
        ..FtsOptions::default()
    };
    let regex_hits = query::query_fts(&entry, "needletoken.*", 10, &regex_opts).unwrap();
    assert!(regex_hits.iter().any(|h| h.path == relpath));

    let conflicting = FtsOptions {
        regex: true,
        fuzzy: true,
        ..FtsOptions::default()
    };
    assert!(query::query_fts(&entry, "needletoken42", 10, &conflicting).is_err());
}

/// Scenario: git-branch visibility. Indexing the same unchanged tree under
/// a second branch must add that branch's visibility onto the existing
/// points rather than replacing the first branch's, and a query scoped to
/// a branch that was never indexed sees nothing.
#[tokio::test]
async fn indexing_a_second_branch_unions_visibility_without_erasing_the_first() {
    let project = tempfile::tempdir().unwrap();
    let index_root = tempfile::tempdir().unwrap();
    let relpath = "shared.py";
    let content = "def shared():\n    return 1\n";
    std::fs::write(project.path().join(relpath), content).unwrap();

    let config = CollectionConfig::default();
    let (entry, projection) = open_collection(index_root.path(), "branches", &config, Duration::from_secs(600));
    let orchestrator = orchestrator();
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient);

    orchestrator.index_collection(project.path(), &config, "main", &projection, entry.clone()).await.unwrap();
    orchestrator.index_collection(project.path(), &config, "feature", &projection, entry.clone()).await.unwrap();

    let point_id = compute_point_id(relpath, 1, 2, content.trim_end_matches('\n'));
    let point = entry.store.get(&point_id).unwrap().expect("shared chunk must survive both indexing passes");
    assert!(point.metadata.branch_visibility.contains(&"main".to_string()));
    assert!(point.metadata.branch_visibility.contains(&"feature".to_string()));

    let main_hits = query::query_semantic(project.path(), &entry, embedder.as_ref(), &projection, "main", content, 5, &QueryFilters::default())
        .await
        .unwrap();
    assert!(main_hits.iter().any(|h| h.path == relpath), "indexing feature must not hide the chunk from main");

    let unknown_branch_hits = query::query_semantic(project.path(), &entry, embedder.as_ref(), &projection, "unindexed-branch", content, 5, &QueryFilters::default())
        .await
        .unwrap();
    assert!(unknown_branch_hits.is_empty());
}

/// Scenario: cache TTL eviction. `CacheEntry` now owns a per-collection TTL
/// sourced from `cache.ttl_seconds`, so a short-TTL collection is evicted
/// by an idle sweep while a long-TTL one in the same `ProjectCache` is not.
#[test]
fn project_cache_evicts_only_entries_past_their_own_ttl() {
    let short_lived = tempfile::tempdir().unwrap();
    let long_lived = tempfile::tempdir().unwrap();
    let config = CollectionConfig::default();

    let cache = ProjectCache::new();
    let (short_entry, _) = build_entry(short_lived.path(), "short", &config, Duration::from_millis(1));
    let (long_entry, _) = build_entry(long_lived.path(), "long", &config, Duration::from_secs(600));
    cache.insert(short_entry).unwrap();
    cache.insert(long_entry).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let evicted = cache.evict_expired();

    assert_eq!(evicted, 1);
    assert!(cache.get("short").is_none());
    assert!(cache.get("long").is_some());
}
