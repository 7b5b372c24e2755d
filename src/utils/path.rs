//! Filesystem path normalization.

use std::path::{Path, PathBuf};

/// Normalize a file system path to absolute form.
///
/// Tries `canonicalize()` first (resolves symlinks, `.`, `..`).
/// Falls back to joining relative paths with the current directory.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
        }
    })
}

/// Expand `~` and resolve `path` against `root` when relative.
pub fn resolve_under(path: &Path, root: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned());
    if expanded.is_absolute() {
        normalize_path(&expanded)
    } else {
        normalize_path(&root.join(expanded))
    }
}
