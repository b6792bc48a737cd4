//! Reconciler (C9): classifies files as added/modified/removed by mtime,
//! and keeps a collection's git-branch visibility set in sync without ever
//! deleting another branch's points.
//!
//! The add/modify/remove classification generalizes the teacher's
//! `embedder.rs::index_workspace_vectors_inner` content-hash diff loop
//! (unchanged/changed/removed against a stored hash map) to the spec's
//! mtime-with-tolerance contract. Git branch detection has no teacher
//! counterpart — it's a minimal, dependency-free reader of `.git/HEAD` and
//! `.git/refs/heads/*`, deliberately not a full git object model.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use ignore::WalkBuilder;

use crate::cache::CacheEntry;
use crate::config::CollectionConfig;
use crate::error::CidxResult;

/// Two mtimes within this tolerance are treated as "unchanged" — guards
/// against filesystem mtime truncation to whole seconds.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum FileChange {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(String),
}

/// Walk `root` with the same discovery rules as the orchestrator and
/// compare each file's mtime against `known` (relpath -> previously-seen
/// mtime). Files in `known` but absent from the walk are reported removed.
pub fn classify_changes(
    root: &Path,
    known: &HashMap<String, SystemTime>,
    config: &CollectionConfig,
) -> CidxResult<Vec<FileChange>> {
    let mut changes = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

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
            Err(_) => continue,
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !config.is_extension_indexable(ext) {
            continue;
        }

        let relpath = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        seen.insert(relpath.clone());

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = match metadata.modified() {
            Ok(m) => m,
            Err(_) => continue,
        };

        match known.get(&relpath) {
            None => changes.push(FileChange::Added(path.to_path_buf())),
            Some(previous) => {
                let delta = mtime
                    .duration_since(*previous)
                    .or_else(|_| previous.duration_since(mtime))
                    .unwrap_or_default();
                if delta > MTIME_TOLERANCE {
                    changes.push(FileChange::Modified(path.to_path_buf()));
                }
            }
        }
    }

    for relpath in known.keys() {
        if !seen.contains(relpath) {
            changes.push(FileChange::Removed(relpath.clone()));
        }
    }

    Ok(changes)
}

/// Read the current branch name from `<repo_root>/.git/HEAD`, without
/// shelling out to git. Falls back to the short commit hash when HEAD is
/// detached.
pub fn current_branch(repo_root: &Path) -> CidxResult<String> {
    let head_path = repo_root.join(".git").join("HEAD");
    let contents = std::fs::read_to_string(&head_path)?;
    let trimmed = contents.trim();

    if let Some(rest) = trimmed.strip_prefix("ref: ") {
        if let Some(name) = rest.strip_prefix("refs/heads/") {
            return Ok(name.to_string());
        }
        return Ok(rest.to_string());
    }

    // Detached HEAD: the file holds a raw commit hash directly.
    Ok(trimmed.chars().take(7).collect())
}

/// Drop `branch` from the `branch_visibility` set of every point under
/// `removed_paths`, without ever deleting points that remain visible on
/// another branch. A point whose visibility set becomes empty is still
/// kept on disk — it simply stops matching any branch-scoped query.
pub fn reconcile_branch_visibility(entry: &CacheEntry, branch: &str, removed_paths: &[String]) -> CidxResult<()> {
    if removed_paths.is_empty() {
        return Ok(());
    }
    let removed: HashSet<&str> = removed_paths.iter().map(|s| s.as_str()).collect();

    let points = entry.store.scan(|meta| removed.contains(meta.path.as_str()))?;
    for mut point in points {
        if point.metadata.branch_visibility.iter().any(|b| b == branch) {
            point.metadata.branch_visibility.retain(|b| b != branch);
            entry.store.upsert_point(&point)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_branch_reads_symbolic_ref() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), "ref: refs/heads/main\n").unwrap();
        assert_eq!(current_branch(dir.path()).unwrap(), "main");
    }

    #[test]
    fn current_branch_handles_detached_head() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), "a1b2c3d4e5f6\n").unwrap();
        assert_eq!(current_branch(dir.path()).unwrap(), "a1b2c3d");
    }

    #[test]
    fn classify_changes_reports_added_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "print(1)").unwrap();
        let config = CollectionConfig::default();
        let changes = classify_changes(dir.path(), &HashMap::new(), &config).unwrap();
        assert!(matches!(changes.as_slice(), [FileChange::Added(_)]));
    }

    #[test]
    fn classify_changes_reports_removed_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = CollectionConfig::default();
        let mut known = HashMap::new();
        known.insert("gone.py".to_string(), SystemTime::now());
        let changes = classify_changes(dir.path(), &known, &config).unwrap();
        assert!(matches!(changes.as_slice(), [FileChange::Removed(name)] if name == "gone.py"));
    }
}
