//! On-disk build directories.
//!
//! ```text
//! <build.root>/
//! ├── serve-5280-next/                  # scratch target of the running build
//! └── serve-5280-1729012345678901234/   # served build, named by source mtime
//! ```
//!
//! Every removal goes through [`BuildDirs::remove`], which refuses paths
//! that are not strictly inside the build root.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use jwalk::WalkDir;
use thiserror::Error;

use crate::debug;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("IO error at `{0}`")]
    Io(PathBuf, #[source] io::Error),

    #[error("refusing to remove `{0}`: not inside the build root")]
    OutsideRoot(PathBuf),
}

/// Build identifier: nanoseconds since the epoch of the newest source change.
pub fn build_id(mtime: SystemTime) -> String {
    mtime
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos())
        .to_string()
}

/// Build directory naming and lifecycle for one server port.
#[derive(Debug, Clone)]
pub struct BuildDirs {
    root: PathBuf,
    port: u16,
}

impl BuildDirs {
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            root: root.into(),
            port,
        }
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn prefix(&self) -> String {
        format!("serve-{}-", self.port)
    }

    /// Scratch directory the builder writes into.
    pub fn next(&self) -> PathBuf {
        self.root.join(format!("{}next", self.prefix()))
    }

    /// Final location of build `id`.
    pub fn build(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", self.prefix(), id))
    }

    pub fn ensure_root(&self) -> Result<(), BuildError> {
        fs::create_dir_all(&self.root).map_err(|e| BuildError::Io(self.root.clone(), e))
    }

    /// Remove `serve-<port>-*` directories left behind by an earlier run.
    pub fn cleanup_stale(&self) -> Result<usize, BuildError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BuildError::Io(self.root.clone(), e)),
        };

        let prefix = self.prefix();
        let mut removed = 0;
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                self.remove(&entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove `path` recursively if it lies strictly inside the build root.
    /// A missing path is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), BuildError> {
        let target = match path.canonicalize() {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BuildError::Io(path.to_path_buf(), e)),
        };
        let root = self
            .root
            .canonicalize()
            .map_err(|e| BuildError::Io(self.root.clone(), e))?;

        if target == root || !target.starts_with(&root) {
            return Err(BuildError::OutsideRoot(path.to_path_buf()));
        }

        debug!("build"; "removing {}", target.display());
        let result = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        result.map_err(|e| BuildError::Io(target, e))
    }
}

/// Deep-copy `src` into `dst`, creating `dst`.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(dst).map_err(|e| BuildError::Io(dst.to_path_buf(), e))?;

    for entry in WalkDir::new(src).skip_hidden(false).min_depth(1) {
        let entry = entry.map_err(|e| BuildError::Io(src.to_path_buf(), io::Error::other(e)))?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| BuildError::Io(target.clone(), e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| BuildError::Io(parent.to_path_buf(), e))?;
            }
            fs::copy(&path, &target).map_err(|e| BuildError::Io(path.clone(), e))?;
        }
    }
    Ok(())
}
