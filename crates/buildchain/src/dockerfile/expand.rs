use std::path::{Path, PathBuf};

use crate::fsutil::normalize;

/// Regular files denoted by `pattern` relative to `base`.
///
/// A file yields itself, a directory yields every file below it, anything
/// else is tried as a glob. No match is an empty result, never an error.
pub fn expand(base: &Path, pattern: &str) -> Vec<PathBuf> {
    let base = if base.as_os_str().is_empty() {
        Path::new(".")
    } else {
        base
    };
    let candidate = base.join(pattern);
    if candidate.is_file() {
        return vec![normalize(&candidate)];
    }
    if candidate.is_dir() {
        return walk_files(&candidate);
    }
    glob_files(base, pattern)
}

fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| normalize(entry.path()))
        .collect();
    out.sort();
    out
}

fn glob_files(base: &Path, pattern: &str) -> Vec<PathBuf> {
    let escaped_base = glob::Pattern::escape(&base.to_string_lossy());
    let full = format!(
        "{}/{}",
        escaped_base.trim_end_matches('/'),
        pattern.trim_start_matches("./")
    );
    let Ok(paths) = glob::glob(&full) else {
        tracing::debug!(pattern = %full, "invalid glob pattern, treating as no match");
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = paths
        .flatten()
        .filter(|p| p.is_file())
        .map(|p| normalize(&p))
        .collect();
    out.sort();
    out
}
