use std::path::{Path, PathBuf};

use quill_core::error::SessionError;

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".cache"];
const FIND_LIMIT: usize = 100;

/// Read a file for the front-end preview, confined to the worktree.
pub fn read_file(worktree: &Path, requested: &str) -> Result<String, SessionError> {
    let path = resolve(worktree, requested)?;
    std::fs::read_to_string(&path)
        .map_err(|_| SessionError::not_found(format!("file {requested}")))
}

/// Case-insensitive substring search over worktree-relative paths, capped at
/// 100 results, for the TUI file picker.
pub fn find_files(worktree: &Path, query: &str) -> Vec<String> {
    let needle = query.to_lowercase();
    let mut results = Vec::new();
    walk(worktree, worktree, &needle, &mut results);
    results.sort();
    results.truncate(FIND_LIMIT);
    results
}

fn walk(root: &Path, dir: &Path, needle: &str, results: &mut Vec<String>) {
    if results.len() >= FIND_LIMIT * 4 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if SKIP_DIRS.contains(&name.as_str()) || name.starts_with('.') {
                continue;
            }
            walk(root, &path, needle, results);
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel.to_string_lossy().to_string();
            if needle.is_empty() || rel.to_lowercase().contains(needle) {
                results.push(rel);
            }
        }
    }
}

/// Resolve a user-supplied path under the worktree, rejecting escapes.
fn resolve(worktree: &Path, requested: &str) -> Result<PathBuf, SessionError> {
    let joined = if Path::new(requested).is_absolute() {
        PathBuf::from(requested)
    } else {
        worktree.join(requested)
    };
    let canonical = joined
        .canonicalize()
        .map_err(|_| SessionError::not_found(format!("file {requested}")))?;
    let root = worktree
        .canonicalize()
        .map_err(|e| SessionError::unknown(format!("worktree unavailable: {e}")))?;
    if !canonical.starts_with(&root) {
        return Err(SessionError::PermissionDenied {
            message: format!("{requested} is outside the worktree"),
        });
    }
    Ok(canonical)
}
