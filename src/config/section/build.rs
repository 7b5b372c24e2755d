//! `[build]` section configuration.
//!
//! ```toml
//! [build]
//! command = ["sphinx-build", "-q", "-b", "html", "content", "{out}"]
//! root = "_serve"             # parent of the serve-<port>-* directories
//! sources = ["content"]       # trees scanned for changes
//! exclude = '(^|/)\.git(/|$)' # regex matched against paths under a source
//! interval_ms = 500           # scan period
//! debounce_ms = 1000          # quiet time after the newest change
//! incremental = true          # seed each build with the previous output
//! ```
//!
//! `{out}` in `command` is replaced by the build target directory. Without
//! any `{out}`, the target is appended as the last argument.

use std::{path::PathBuf, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigDiagnostics;

/// VCS metadata, editor swap/backup files, Python caches.
pub const DEFAULT_EXCLUDE: &str =
    r"(^|/)(\.git|\.hg|\.svn|__pycache__|node_modules)(/|$)|(^|/)\.#|~$|\.sw[px]$";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub command: Vec<String>,
    pub root: PathBuf,
    pub sources: Vec<PathBuf>,
    pub exclude: String,
    pub interval_ms: u64,
    pub debounce_ms: u64,
    pub incremental: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            root: PathBuf::from("_serve"),
            sources: vec![PathBuf::from("content")],
            exclude: DEFAULT_EXCLUDE.to_string(),
            interval_ms: 500,
            debounce_ms: 1000,
            incremental: true,
        }
    }
}

impl BuildConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Compiled `exclude`; an empty pattern excludes nothing.
    pub fn exclude_regex(&self) -> Result<Option<Regex>, regex::Error> {
        if self.exclude.is_empty() {
            return Ok(None);
        }
        Regex::new(&self.exclude).map(Some)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        match self.command.first() {
            None => diag.error_with_hint(
                "build.command",
                "no build command configured",
                "e.g. command = [\"make\", \"html\", \"BUILDDIR={out}\"]",
            ),
            Some(program) if which::which(program).is_err() => diag.error(
                "build.command",
                format!("`{program}` not found in PATH"),
            ),
            Some(_) => {}
        }

        if let Err(e) = self.exclude_regex() {
            diag.error("build.exclude", format!("invalid regex: {e}"));
        }
        if self.interval_ms == 0 {
            diag.error("build.interval_ms", "must be greater than 0");
        }
        if self.sources.is_empty() {
            diag.warn("build.sources", "no sources; only the initial build will run");
        }
        for source in &self.sources {
            if !source.exists() {
                diag.warn("build.sources", format!("`{}` does not exist", source.display()));
            }
        }
    }
}
