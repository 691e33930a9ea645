use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directories never worth tracking between turns.
const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".cache"];
/// Walk cutoff for degenerate worktrees; a watcher owns the long tail.
const MAX_FILES: usize = 20_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub mtime_ms: u64,
    pub size: u64,
}

pub type FileSnapshot = HashMap<PathBuf, FileStat>;

/// Metadata-only snapshot of the worktree taken before a turn; compared
/// afterwards to attribute file changes to the turn.
pub fn capture(root: &Path) -> FileSnapshot {
    let mut snapshot = HashMap::new();
    walk(root, root, &mut snapshot);
    snapshot
}

fn walk(root: &Path, dir: &Path, snapshot: &mut FileSnapshot) {
    if snapshot.len() >= MAX_FILES {
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
            walk(root, &path, snapshot);
        } else if let Ok(meta) = entry.metadata() {
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            if let Ok(rel) = path.strip_prefix(root) {
                snapshot.insert(
                    rel.to_path_buf(),
                    FileStat {
                        mtime_ms,
                        size: meta.len(),
                    },
                );
            }
        }
    }
}

/// Worktree-relative paths created, modified or removed since `before`,
/// sorted for stable patch parts.
pub fn changed_paths(before: &FileSnapshot, after: &FileSnapshot) -> Vec<String> {
    let mut changed = Vec::new();
    for (path, stat) in after {
        match before.get(path) {
            Some(old) if old == stat => {}
            _ => changed.push(path.to_string_lossy().to_string()),
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            changed.push(path.to_string_lossy().to_string());
        }
    }
    changed.sort();
    changed
}
