//! cidx: a code-intelligence indexing and query daemon combining dense
//! semantic search, full-text search, and temporal/commit-history search
//! over a git-tracked source tree.
//!
//! Split into a library and a thin `main.rs` binary so integration tests
//! under `tests/` can drive the orchestrator, query engine, and cache
//! directly against a `tempfile::tempdir()`-rooted collection with a stub
//! `EmbeddingClient`, without going through the RPC socket.

pub mod cache;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fts;
pub mod hnsw;
pub mod lang;
pub mod orchestrator;
pub mod projection;
pub mod query;
pub mod reconciler;
pub mod rpc;
pub mod store;
pub mod watcher;
