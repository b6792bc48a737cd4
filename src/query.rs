//! Query Engine (C11): dispatches semantic, full-text, hybrid, and temporal
//! queries against a collection's cached indexes.
//!
//! No teacher module survived with this shape — `routes/search.rs` (the
//! nearest equivalent, an HTTP handler layer) was dropped along with the
//! axum surface it served. The result/option types below are named after
//! its inferred contract (`SearchQuery`/`SearchResponse`-shaped fields) but
//! are authored fresh directly against C5 (`hnsw`), C6 (`fts`), and C7
//! (`cache`); hybrid interleaving follows SPEC_FULL.md §9's explicit
//! "no score merging across modes" decision.

use std::path::Path;

use globset::Glob;

use crate::cache::CacheEntry;
use crate::embedding::EmbeddingClient;
use crate::fts::{FtsQuery, FtsQueryMode};
use crate::projection::{Distance, ProjectionMatrix};
use crate::store::ChunkType;
use crate::error::{CidxError, CidxResult};

/// Compile a `path_filter`/`exclude_path` pattern as a glob (SPEC_FULL.md
/// §4.6's "glob-to-regex" path filter applies uniformly across query modes).
fn compile_glob(pattern: &str) -> CidxResult<globset::GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| CidxError::BadInput(format!("invalid path glob {pattern:?}: {e}")))
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub language: Option<String>,
    pub path_filter: Option<String>,
    pub exclude_path: Option<String>,
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub path: String,
    pub line_start: usize,
    pub line_end: usize,
    pub language: String,
    pub score: f32,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Semantic,
    Fts,
    Hybrid,
    Temporal,
}

/// Embed `text`, project it, run `knn_query` under the cache entry's read
/// lock, then resolve labels back to chunk metadata — dropping points whose
/// backing file has disappeared and points not visible on `branch`.
pub async fn query_semantic(
    project_root: &Path,
    entry: &CacheEntry,
    embedder: &dyn EmbeddingClient,
    projection: &ProjectionMatrix,
    branch: &str,
    text: &str,
    k: usize,
    filters: &QueryFilters,
) -> CidxResult<Vec<QueryHit>> {
    let raw_vectors = embedder.embed(std::slice::from_ref(&text.to_string())).await?;
    let raw_vector = raw_vectors
        .into_iter()
        .next()
        .ok_or_else(|| CidxError::Internal(anyhow::anyhow!("embedding client returned no vector")))?;
    let projected = projection.apply(&raw_vector)?;

    // Over-fetch so post-filtering (branch visibility, missing files,
    // language/path filters) still leaves up to `k` results.
    let over_fetch = (k * 4).max(k + 16);

    let raw_hits = {
        let hnsw = entry.try_read_hnsw()?;
        hnsw.search(&projected, over_fetch)?
    };

    let distance_kind = entry.meta.read().distance;
    let path_matcher = filters.path_filter.as_deref().map(compile_glob).transpose()?;
    let exclude_matcher = filters.exclude_path.as_deref().map(compile_glob).transpose()?;
    let mut hits = Vec::with_capacity(k);

    for (point_id, distance) in raw_hits {
        let Some(point) = entry.store.get(&point_id)? else {
            continue;
        };
        if !point.metadata.branch_visibility.iter().any(|b| b == branch) {
            continue;
        }
        if !project_root.join(&point.metadata.path).exists() {
            continue;
        }
        if let Some(lang) = &filters.language {
            if !point.metadata.language.eq_ignore_ascii_case(lang) {
                continue;
            }
        }
        if let Some(matcher) = &path_matcher {
            if !matcher.is_match(&point.metadata.path) {
                continue;
            }
        }
        if let Some(matcher) = &exclude_matcher {
            if matcher.is_match(&point.metadata.path) {
                continue;
            }
        }

        let score = match distance_kind {
            Distance::Cosine => 1.0 - distance,
            Distance::L2 => -distance,
        };
        if let Some(min_score) = filters.min_score {
            if score < min_score {
                continue;
            }
        }

        hits.push((
            distance,
            QueryHit {
                path: point.metadata.path,
                line_start: point.metadata.line_start,
                line_end: point.metadata.line_end,
                language: point.metadata.language,
                score,
                content: String::new(),
            },
        ));
        if hits.len() >= k {
            break;
        }
    }

    hits.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (a.1.path.as_str(), a.1.line_start).cmp(&(b.1.path.as_str(), b.1.line_start)))
    });

    Ok(hits.into_iter().map(|(_, hit)| hit).collect())
}

#[derive(Debug, Clone)]
pub struct FtsOptions {
    pub case_sensitive: bool,
    pub fuzzy: bool,
    pub edit_distance: u8,
    pub regex: bool,
    pub snippet_lines: usize,
    pub language: Option<String>,
    pub path_filter: Option<String>,
    pub exclude_path: Option<String>,
}

impl Default for FtsOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            fuzzy: false,
            edit_distance: 2,
            regex: false,
            snippet_lines: 3,
            language: None,
            path_filter: None,
            exclude_path: None,
        }
    }
}

pub fn query_fts(entry: &CacheEntry, text: &str, limit: usize, options: &FtsOptions) -> CidxResult<Vec<QueryHit>> {
    if options.regex && options.fuzzy {
        return Err(CidxError::BadInput("regex and fuzzy query modes are mutually exclusive".to_string()));
    }

    let mode = if options.regex {
        FtsQueryMode::TokenRegex
    } else if options.fuzzy {
        FtsQueryMode::Fuzzy {
            max_distance: options.edit_distance,
        }
    } else if options.case_sensitive {
        FtsQueryMode::CaseSensitive
    } else {
        FtsQueryMode::Exact
    };

    let query = FtsQuery {
        text: text.to_string(),
        mode,
        language: options.language.clone(),
        path_filter: options.path_filter.clone(),
        exclude_path: options.exclude_path.clone(),
        snippet_lines: options.snippet_lines,
        limit,
    };

    let fts_hits = entry.fts.lock().search(&query)?;
    Ok(fts_hits
        .into_iter()
        .map(|hit| QueryHit {
            path: hit.path,
            line_start: hit.line_start as usize,
            line_end: hit.line_end as usize,
            language: hit.language,
            score: hit.score,
            content: hit.snippet,
        })
        .collect())
}

/// Run semantic and FTS concurrently and interleave their results one at a
/// time. Each subsystem's own ranking is preserved — scores are never
/// compared or merged across modes (SPEC_FULL.md §9 Open Question
/// resolution).
pub async fn query_hybrid(
    project_root: &Path,
    entry: &CacheEntry,
    embedder: &dyn EmbeddingClient,
    projection: &ProjectionMatrix,
    branch: &str,
    text: &str,
    k: usize,
    semantic_filters: &QueryFilters,
    fts_options: &FtsOptions,
) -> CidxResult<Vec<QueryHit>> {
    let (semantic, fts) = tokio::join!(
        query_semantic(project_root, entry, embedder, projection, branch, text, k, semantic_filters),
        async { query_fts(entry, text, k, fts_options) }
    );
    let semantic = semantic?;
    let fts = fts?;

    let mut interleaved = Vec::with_capacity(semantic.len() + fts.len());
    let mut s = semantic.into_iter();
    let mut f = fts.into_iter();
    loop {
        let a = s.next();
        let b = f.next();
        if a.is_none() && b.is_none() {
            break;
        }
        if let Some(hit) = a {
            interleaved.push(hit);
        }
        if let Some(hit) = b {
            interleaved.push(hit);
        }
    }
    Ok(interleaved)
}

#[derive(Debug, Clone, Default)]
pub struct TemporalFilters {
    pub time_range: Option<(i64, i64)>,
    pub chunk_type: Option<ChunkType>,
    pub author: Option<String>,
}

/// Same retrieval path as `query_semantic`, restricted to points whose
/// metadata satisfies the temporal filters. Requires that temporal
/// indexing (commit message/diff chunks) was run for this collection.
pub async fn query_temporal(
    project_root: &Path,
    entry: &CacheEntry,
    embedder: &dyn EmbeddingClient,
    projection: &ProjectionMatrix,
    branch: &str,
    text: &str,
    k: usize,
    base_filters: &QueryFilters,
    temporal: &TemporalFilters,
) -> CidxResult<Vec<QueryHit>> {
    // Over-fetch broadly since temporal filters are applied after the
    // generic semantic pass narrows to branch-visible, file-present points.
    let over_fetch = k.saturating_mul(4).max(k + 32);
    let candidates = query_semantic(project_root, entry, embedder, projection, branch, text, over_fetch, base_filters).await?;

    let mut filtered = Vec::with_capacity(k);
    for hit in candidates {
        if let Some(point) = entry
            .store
            .scan(|meta| meta.path == hit.path && meta.line_start == hit.line_start)?
            .into_iter()
            .next()
        {
            if let Some((start, end)) = temporal.time_range {
                match point.metadata.timestamp {
                    Some(ts) if ts >= start && ts <= end => {}
                    _ => continue,
                }
            }
            if let Some(wanted_type) = temporal.chunk_type {
                if point.metadata.chunk_type != wanted_type {
                    continue;
                }
            }
            if let Some(author) = &temporal.author {
                if point.metadata.author.as_deref() != Some(author.as_str()) {
                    continue;
                }
            }
        }
        filtered.push(hit);
        if filtered.len() >= k {
            break;
        }
    }
    Ok(filtered)
}
