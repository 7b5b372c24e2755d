//! Build scheduler: scan sources, debounce, build, swap the served directory.
//!
//! ```text
//! scan ──► Unchanged ──► idle
//!   │
//!   ├────► Debounce(rem) ──► wait, rescan
//!   │
//!   └────► Build(mtime) ──► [restart_on_change] ──► shutdown(3)
//!                │
//!                ▼
//!          seed next/ ──► builder ──► ok:  rename to serve-<port>-<mtime>,
//!                                          swap, delete previous, publish
//!                                     err: drop next/, [exit_on_failure] shutdown(1)
//! ```
//!
//! Request handlers hold [`BuildState`]'s read lock while resolving and
//! reading a file; the previous build is deleted under the write lock, so
//! no request can see a half-removed directory.

mod dirs;
mod scan;

pub use dirs::{BuildDirs, BuildError, build_id, copy_dir};
pub use scan::Scanner;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use anyhow::Result;
use parking_lot::{RwLock, RwLockReadGuard};
use serde_json::Value;

use crate::{
    config::SiteConfig,
    core::{EXIT_FAILURE, EXIT_RESTART, is_shutdown, request_shutdown},
    debug,
    events::ValueObservable,
    log,
    logger::{status_error, status_success},
    utils::exec::Cmd,
};

/// The external site builder: fills `target` with the rendered site.
pub trait Builder: Send {
    fn build(&self, target: &Path) -> Result<()>;
}

impl<F> Builder for F
where
    F: Fn(&Path) -> Result<()> + Send,
{
    fn build(&self, target: &Path) -> Result<()> {
        self(target)
    }
}

/// Runs the configured command, substituting `{out}` with the target.
/// The target is also exported as `LIVESITE_OUT`.
pub struct CommandBuilder {
    command: Vec<String>,
    cwd: PathBuf,
}

const OUT_PLACEHOLDER: &str = "{out}";

impl CommandBuilder {
    pub fn new(command: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
        }
    }

    fn argv(&self, target: &Path) -> Vec<String> {
        let out = target.to_string_lossy();
        let mut argv: Vec<String> = self
            .command
            .iter()
            .map(|arg| arg.replace(OUT_PLACEHOLDER, &out))
            .collect();
        if !self.command.iter().any(|arg| arg.contains(OUT_PLACEHOLDER)) {
            argv.push(out.into_owned());
        }
        argv
    }
}

impl Builder for CommandBuilder {
    fn build(&self, target: &Path) -> Result<()> {
        let argv = self.argv(target);
        debug!("build"; "running {}", argv.join(" "));
        Cmd::from_slice(&argv)
            .cwd(&self.cwd)
            .env("LIVESITE_OUT", target)
            .run()?;
        Ok(())
    }
}

/// A completed build being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDir {
    pub id: String,
    pub path: PathBuf,
}

/// Pointer to the served build, shared with request handlers.
#[derive(Debug, Default)]
pub struct BuildState {
    current: RwLock<Option<BuildDir>>,
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold this guard while reading from the served directory.
    pub fn read(&self) -> RwLockReadGuard<'_, Option<BuildDir>> {
        self.current.read()
    }

    #[cfg(test)]
    pub fn current_id(&self) -> Option<String> {
        self.current.read().as_ref().map(|b| b.id.clone())
    }

    #[cfg(test)]
    pub(crate) fn serve_dir(&self, build: BuildDir) {
        *self.current.write() = Some(build);
    }
}

/// Outcome of comparing the newest source mtime with the last build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Unchanged,
    /// Sources changed too recently; check again after this long.
    Debounce(Duration),
    Build(SystemTime),
}

/// A source mtime in the future keeps debouncing until it is in the past.
pub fn plan(
    latest: SystemTime,
    last: Option<SystemTime>,
    now: SystemTime,
    debounce: Duration,
) -> Plan {
    if last.is_some_and(|last| latest <= last) {
        return Plan::Unchanged;
    }
    match now.duration_since(latest) {
        Ok(age) if age >= debounce => Plan::Build(latest),
        Ok(age) => Plan::Debounce(debounce - age),
        Err(_) => Plan::Debounce(debounce),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Idle,
    Wait(Duration),
    Built(String),
    Failed,
    Shutdown { code: i32, reason: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub debounce: Duration,
    pub incremental: bool,
    pub watch: bool,
    pub restart_on_change: bool,
    pub exit_on_failure: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &SiteConfig) -> Self {
        Self {
            interval: config.build.interval(),
            debounce: config.build.debounce(),
            incremental: config.build.incremental,
            watch: config.serve.watch,
            restart_on_change: config.serve.restart_on_change,
            exit_on_failure: config.serve.exit_on_failure,
        }
    }
}

/// Why a rebuild did not publish. Cleanup failures leave the served build
/// alone and do not count as a build result.
enum RebuildError {
    Cleanup(BuildError),
    Build(anyhow::Error),
}

impl From<BuildError> for RebuildError {
    fn from(e: BuildError) -> Self {
        Self::Build(e.into())
    }
}

pub struct BuildScheduler {
    scanner: Scanner,
    dirs: BuildDirs,
    builder: Box<dyn Builder>,
    state: Arc<BuildState>,
    observable: Arc<ValueObservable>,
    settings: SchedulerSettings,
    /// Source mtime of the last attempted build, successful or not.
    last: Option<SystemTime>,
}

/// Granularity of shutdown checks while sleeping.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

impl BuildScheduler {
    pub fn new(
        scanner: Scanner,
        dirs: BuildDirs,
        builder: Box<dyn Builder>,
        state: Arc<BuildState>,
        observable: Arc<ValueObservable>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            scanner,
            dirs,
            builder,
            state,
            observable,
            settings,
            last: None,
        }
    }

    /// Create the build root and drop directories of earlier runs.
    pub fn prepare(&self) -> Result<(), BuildError> {
        self.dirs.ensure_root()?;
        let removed = self.dirs.cleanup_stale()?;
        if removed > 0 {
            debug!("build"; "removed {} stale build dir(s)", removed);
        }
        Ok(())
    }

    /// One scheduler transition at wall-clock `now`.
    pub fn step(&mut self, now: SystemTime) -> Step {
        let latest = self.scanner.latest_mtime();
        let mtime = match plan(latest, self.last, now, self.settings.debounce) {
            Plan::Unchanged => return Step::Idle,
            Plan::Debounce(remaining) => return Step::Wait(remaining),
            Plan::Build(mtime) => mtime,
        };

        if self.last.is_some() && self.settings.restart_on_change {
            return Step::Shutdown {
                code: EXIT_RESTART,
                reason: "sources changed, restarting".into(),
            };
        }
        let previous = self.last.replace(mtime);

        let id = build_id(mtime);
        let started = Instant::now();
        log!("build"; "building {}", id);

        match self.rebuild(&id) {
            Ok(()) => {
                status_success(&format!("built {} in {:.1?}", id, started.elapsed()));
                Step::Built(id)
            }
            Err(RebuildError::Cleanup(e)) => {
                // Not a build result: retry the same sources next cycle
                log!("build"; "skipping build, cleanup failed: {}", e);
                self.last = previous;
                Step::Wait(self.settings.interval)
            }
            Err(RebuildError::Build(e)) => {
                status_error("build failed", &format!("{e:#}"));
                if let Err(e) = self.dirs.remove(&self.dirs.next()) {
                    log!("build"; "failed to remove scratch dir: {}", e);
                }
                if self.settings.exit_on_failure {
                    Step::Shutdown {
                        code: EXIT_FAILURE,
                        reason: "build failed".into(),
                    }
                } else {
                    Step::Failed
                }
            }
        }
    }

    fn rebuild(&self, id: &str) -> Result<(), RebuildError> {
        let next = self.dirs.next();
        let target = self.dirs.build(id);
        self.dirs.remove(&next).map_err(RebuildError::Cleanup)?;
        self.dirs.remove(&target).map_err(RebuildError::Cleanup)?;

        let previous = self.state.read().clone();
        match previous {
            Some(prev) if self.settings.incremental => copy_dir(&prev.path, &next)?,
            _ => fs::create_dir_all(&next).map_err(|e| BuildError::Io(next.clone(), e))?,
        }

        self.builder.build(&next).map_err(RebuildError::Build)?;

        fs::rename(&next, &target).map_err(|e| BuildError::Io(target.clone(), e))?;
        self.swap(BuildDir {
            id: id.to_string(),
            path: target,
        });
        self.observable.set(Value::String(id.to_string()));
        Ok(())
    }

    fn swap(&self, build: BuildDir) {
        let mut current = self.state.current.write();
        if let Some(old) = current.replace(build)
            && let Err(e) = self.dirs.remove(&old.path)
        {
            log!("build"; "failed to remove {}: {}", old.path.display(), e);
        }
    }

    /// Step until shutdown. Without watching, stop after the first build.
    pub fn run(mut self) {
        while !is_shutdown() {
            let pause = match self.step(SystemTime::now()) {
                Step::Shutdown { code, reason } => {
                    request_shutdown(code, &reason);
                    return;
                }
                Step::Wait(remaining) => remaining,
                Step::Built(_) | Step::Failed | Step::Idle if !self.settings.watch => return,
                Step::Built(_) | Step::Failed | Step::Idle => self.settings.interval,
            };
            sleep_unless_shutdown(pause);
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("build".into())
            .spawn(move || self.run())
    }
}

fn sleep_unless_shutdown(duration: Duration) {
    let deadline = Instant::now() + duration;
    while !is_shutdown() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
