//! External command execution.
//!
//! The site builder is an opaque subprocess: it gets a target directory and
//! reports success through its exit status. Its stderr is forwarded to the
//! log with color codes stripped.
//!
//! ```ignore
//! Cmd::from_slice(&["make", "html"])
//!     .env("OUT", target)
//!     .cwd(root)
//!     .run()?;
//! ```

use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::{Command, Output},
    sync::LazyLock,
};

use anyhow::{Context, Result};
use regex::Regex;

use crate::log;

/// Command builder for the external build step.
#[derive(Default)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

impl Cmd {
    /// Create from a command array (`["make", "html"]`): the first element
    /// is the program.
    pub fn from_slice<S: AsRef<OsStr>>(cmd: &[S]) -> Self {
        let mut iter = cmd.iter().map(|s| s.as_ref().to_owned());
        Self {
            program: iter.next().unwrap_or_default(),
            args: iter.collect(),
            ..Default::default()
        }
    }

    pub fn cwd<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Run to completion. A non-zero exit status is an error carrying the
    /// command's stderr.
    pub fn run(self) -> Result<Output> {
        let name = self.program_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(self.envs.iter().cloned());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to execute `{name}`"))?;

        if !output.status.success() {
            anyhow::bail!(format_error(&name, &output));
        }
        log_stderr(&name, &String::from_utf8_lossy(&output.stderr));
        Ok(output)
    }
}

/// Non-empty stderr lines, color codes stripped.
fn stderr_lines(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(|line| strip_ansi(line).trim_end().to_string())
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Log what a successful command wrote to stderr, as one block.
fn log_stderr(name: &str, stderr: &str) {
    let lines = stderr_lines(stderr);
    if !lines.is_empty() {
        log!(name; "{}", lines.join("\n"));
    }
}

static ANSI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

fn strip_ansi(s: &str) -> Cow<'_, str> {
    ANSI.replace_all(s, "")
}

fn format_error(name: &str, output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);

    let mut msg = format!("command `{name}` failed with {}", output.status);
    let kept = stderr_lines(&String::from_utf8_lossy(&output.stderr));
    if !kept.is_empty() {
        msg.push('\n');
        msg.push_str(&kept.join("\n"));
    }

    let stdout = stdout.trim();
    if !stdout.is_empty() {
        msg.push_str("\nstdout:\n");
        msg.push_str(stdout);
    }
    msg
}
