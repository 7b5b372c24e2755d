//! Source tree scanning for the newest modification time.

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use jwalk::WalkDir;
use regex::Regex;

/// Finds the newest mtime under a set of source paths.
///
/// Directories count too, so deleting a file (which touches its parent)
/// is seen as a change. Paths matching `exclude`, relative to their source
/// and `/`-separated, are pruned together with everything below them.
#[derive(Debug, Clone)]
pub struct Scanner {
    sources: Vec<PathBuf>,
    exclude: Option<Regex>,
}

impl Scanner {
    pub fn new(sources: Vec<PathBuf>, exclude: Option<Regex>) -> Self {
        Self { sources, exclude }
    }

    /// Newest mtime, or the UNIX epoch when nothing is found.
    pub fn latest_mtime(&self) -> SystemTime {
        self.sources
            .iter()
            .filter_map(|source| self.scan_source(source))
            .max()
            .unwrap_or(UNIX_EPOCH)
    }

    fn scan_source(&self, source: &Path) -> Option<SystemTime> {
        let meta = source.metadata().ok()?;
        if !meta.is_dir() {
            return meta.modified().ok();
        }

        let exclude = self.exclude.clone();
        let root = source.to_path_buf();
        WalkDir::new(source)
            .skip_hidden(false)
            .process_read_dir(move |_depth, _path, _state, children| {
                if let Some(re) = &exclude {
                    children.retain(|entry| {
                        entry
                            .as_ref()
                            .map_or(true, |e| !is_excluded(re, &root, &e.path()))
                    });
                }
            })
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok()?.modified().ok())
            .max()
    }
}

fn is_excluded(re: &Regex, root: &Path, path: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    let rel: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    re.is_match(&rel.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::section::DEFAULT_EXCLUDE;
    use std::{fs, time::Duration};
    use tempfile::TempDir;

    fn touch(path: &Path, secs: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    fn set_dir_mtime(path: &Path, secs: u64) {
        let dir = fs::File::open(path).unwrap();
        dir.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    /// content/{a.rst, sub/b.rst, .git/HEAD}, every mtime pinned low.
    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let content = tmp.path().join("content");
        fs::create_dir_all(content.join("sub")).unwrap();
        fs::create_dir_all(content.join(".git")).unwrap();
        for file in ["a.rst", "sub/b.rst", ".git/HEAD"] {
            fs::write(content.join(file), "x").unwrap();
            touch(&content.join(file), 100);
        }
        for dir in [".git", "sub", ""] {
            set_dir_mtime(&content.join(dir), 100);
        }
        tmp
    }

    fn scanner(tmp: &TempDir) -> Scanner {
        Scanner::new(
            vec![tmp.path().join("content")],
            Some(Regex::new(DEFAULT_EXCLUDE).unwrap()),
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_newest_file_wins() {
        let tmp = tree();
        let scanner = scanner(&tmp);
        assert_eq!(scanner.latest_mtime(), UNIX_EPOCH + Duration::from_secs(100));

        touch(&tmp.path().join("content/sub/b.rst"), 250);
        assert_eq!(scanner.latest_mtime(), UNIX_EPOCH + Duration::from_secs(250));
    }

    #[cfg(unix)]
    #[test]
    fn test_excluded_paths_ignored() {
        let tmp = tree();
        let scanner = scanner(&tmp);

        touch(&tmp.path().join("content/.git/HEAD"), 900);
        set_dir_mtime(&tmp.path().join("content/.git"), 900);
        assert_eq!(scanner.latest_mtime(), UNIX_EPOCH + Duration::from_secs(100));
    }

    #[test]
    fn test_single_file_source() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf.py");
        fs::write(&conf, "x").unwrap();
        touch(&conf, 77);

        let scanner = Scanner::new(vec![conf, tmp.path().join("missing")], None);
        assert_eq!(scanner.latest_mtime(), UNIX_EPOCH + Duration::from_secs(77));
    }

    #[test]
    fn test_empty_sources_scan_as_epoch() {
        assert_eq!(Scanner::new(Vec::new(), None).latest_mtime(), UNIX_EPOCH);
    }
}
