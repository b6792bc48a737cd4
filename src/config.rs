use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CidxError, CidxResult};

/// Directories that are never walked during indexing, regardless of
/// `.gitignore` contents. Kept as one shared list so discovery (C8) and the
/// watch loop (C10) never drift apart.
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    "node_modules", ".git", "target", "dist", "build", "out", ".next", ".nuxt",
    "__pycache__", ".venv", "venv", "vendor", ".cache", ".idea", ".vscode",
    ".terraform", "coverage", ".pytest_cache", ".mypy_cache", ".cidx",
];

/// Extensions considered indexable by default (lowercase, no dot). A
/// project's `config.json` may override this via `file_extensions`.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "rs", "py", "go", "java", "c",
    "cpp", "h", "hpp", "cs", "rb", "php", "swift", "kt", "scala", "html",
    "css", "scss", "json", "yaml", "yml", "toml", "md", "sql", "sh",
];

fn default_max_file_size() -> u64 {
    1_048_576
}
fn default_worker_count() -> usize {
    8
}
fn default_embedding_dimensions() -> usize {
    1536
}
fn default_hnsw_m() -> usize {
    16
}
fn default_hnsw_ef_construction() -> usize {
    200
}
fn default_hnsw_ef_search() -> usize {
    50
}
fn default_cache_ttl_seconds() -> u64 {
    600
}
fn default_watch_debounce_seconds() -> f64 {
    2.0
}

/// On-disk `.cidx/config.json` schema. Every field is optional there; this
/// struct is the *merged* result after defaults and environment overrides
/// are applied, so every field here is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingSettings {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            worker_count: default_worker_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "voyage-code-3".to_string(),
            dimensions: default_embedding_dimensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswSettings {
    #[serde(rename = "M", default = "default_hnsw_m")]
    pub m: usize,
    #[serde(default = "default_hnsw_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_hnsw_ef_search")]
    pub ef_search: usize,
}

impl Default for HnswSettings {
    fn default() -> Self {
        Self {
            m: default_hnsw_m(),
            ef_construction: default_hnsw_ef_construction(),
            ef_search: default_hnsw_ef_search(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    #[serde(default = "default_watch_debounce_seconds")]
    pub debounce_seconds: f64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_seconds: default_watch_debounce_seconds(),
        }
    }
}

/// Raw shape of `.cidx/config.json`. Every key is optional; unrecognized
/// keys are ignored with a warning (see `load_collection_config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionConfigFile {
    pub file_extensions: Option<Vec<String>>,
    pub exclude_dirs: Option<Vec<String>>,
    pub indexing: Option<IndexingSettings>,
    pub embedding: Option<EmbeddingSettings>,
    pub hnsw: Option<HnswSettings>,
    pub cache: Option<CacheSettings>,
    pub watch: Option<WatchSettings>,
}

/// Fully-merged per-collection configuration: defaults, then `config.json`,
/// then environment variable overrides.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    pub file_extensions: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub indexing: IndexingSettings,
    pub embedding: EmbeddingSettings,
    pub hnsw: HnswSettings,
    pub cache: CacheSettings,
    pub watch: WatchSettings,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            file_extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            exclude_dirs: DEFAULT_EXCLUDE_DIRS.iter().map(|s| s.to_string()).collect(),
            indexing: IndexingSettings::default(),
            embedding: EmbeddingSettings::default(),
            hnsw: HnswSettings::default(),
            cache: CacheSettings::default(),
            watch: WatchSettings::default(),
        }
    }
}

impl CollectionConfig {
    pub fn is_extension_indexable(&self, ext: &str) -> bool {
        self.file_extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// Load `<project_root>/.cidx/config.json` (if present), layering it over
/// defaults. Unknown top-level keys in the raw JSON are reported as a
/// warning but never fail the load — matches SPEC_FULL.md §6 "unknown keys
/// are ignored with a warning".
pub fn load_collection_config(project_root: &Path) -> CidxResult<CollectionConfig> {
    let mut config = CollectionConfig::default();
    let config_path = project_root.join(".cidx").join("config.json");

    if !config_path.exists() {
        return Ok(config);
    }

    let raw = std::fs::read_to_string(&config_path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| CidxError::Config(format!("{}: {e}", config_path.display())))?;

    let known_keys = [
        "file_extensions", "exclude_dirs", "indexing", "embedding", "hnsw",
        "cache", "watch",
    ];
    if let Some(obj) = value.as_object() {
        for key in obj.keys() {
            if !known_keys.contains(&key.as_str()) {
                tracing::warn!(key = %key, path = %config_path.display(), "ignoring unrecognized config key");
            }
        }
    }

    let file: CollectionConfigFile = serde_json::from_value(value)
        .map_err(|e| CidxError::Config(format!("{}: {e}", config_path.display())))?;

    if let Some(exts) = file.file_extensions {
        config.file_extensions = exts;
    }
    if let Some(dirs) = file.exclude_dirs {
        config.exclude_dirs = dirs;
    }
    if let Some(v) = file.indexing {
        config.indexing = v;
    }
    if let Some(v) = file.embedding {
        config.embedding = v;
    }
    if let Some(v) = file.hnsw {
        config.hnsw = v;
    }
    if let Some(v) = file.cache {
        config.cache = v;
    }
    if let Some(v) = file.watch {
        config.watch = v;
    }

    Ok(config)
}

/// Process-wide daemon settings, sourced from the environment. Distinct
/// from `CollectionConfig`, which is per-project.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir_name: String,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub voyage_api_key: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir_name: std::env::var("CIDX_DATA_DIR").unwrap_or_else(|_| ".cidx".to_string()),
            log_level: std::env::var("CIDX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_dir: std::env::var("CIDX_LOG_DIR").ok().map(PathBuf::from),
            voyage_api_key: std::env::var("VOYAGE_API_KEY").ok(),
        }
    }

    pub fn collection_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.data_dir_name)
    }
}
