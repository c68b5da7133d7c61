use anyhow::{anyhow, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File names the JSON Lines codec can read: `.jsonl`, `.ndjson`, optionally `.zst`-compressed.
pub const DEFAULT_SOURCE_PATTERN: &str = r"(?i)\.(jsonl|ndjson)(\.zst)?$";

pub fn default_source_pattern() -> Result<Regex> {
    Regex::new(DEFAULT_SOURCE_PATTERN).map_err(|e| anyhow!("bad source pattern: {}", e))
}

/// Collect regular files under `dir` whose file name matches `pattern`,
/// sorted by path so merge order is stable. `max_depth = 1` means no recursion.
pub fn discover_sources(dir: &Path, pattern: &Regex, max_depth: usize) -> Vec<PathBuf> {
    if !dir.exists() {
        tracing::warn!("source dir {} does not exist", dir.display());
        return Vec::new();
    }
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth.max(1))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().map(|n| pattern.is_match(n)).unwrap_or(false))
        .map(|e| e.path().to_path_buf())
        .collect();
    found.sort();
    found
}
