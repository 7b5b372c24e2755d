//! Colored terminal logging.
//!
//! - `log!` prints one message with a colored `[module]` prefix
//! - `debug!` does the same, but only with `--verbose`
//! - [`WatchStatus`] keeps the latest build result as a single block that
//!   the next result overwrites
//!
//! ```ignore
//! log!("serve"; "http://{}", addr);
//! debug!("events"; "session {} opened", sid);
//! status_success("built serve-5280-1700000000000000000");
//! ```

use crossterm::{
    cursor, execute,
    terminal::{Clear, ClearType},
};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use std::{
    io::{Write, stdout},
    sync::LazyLock,
    sync::atomic::{AtomicBool, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Global verbose flag (set by --verbose)
static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(v: bool) {
    VERBOSE.store(v, Ordering::SeqCst);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

/// Log a message with a colored module prefix
///
/// ```ignore
/// log!("module"; "message with {} formatting", args);
/// ```
#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Log a debug message (only shown with --verbose)
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

pub fn log(module: &str, message: &str) {
    let prefix = colorize_prefix(module);

    let mut stdout = stdout().lock();
    execute!(stdout, Clear(ClearType::UntilNewLine)).ok();
    writeln!(stdout, "{prefix} {message}").ok();
    stdout.flush().ok();
}

fn colorize_prefix(module: &str) -> String {
    let prefix = format!("[{module}]");
    match module.to_ascii_lowercase().as_str() {
        "serve" => prefix.bright_blue().bold().to_string(),
        "build" => prefix.bright_green().bold().to_string(),
        "events" | "dispatch" => prefix.bright_cyan().bold().to_string(),
        "error" => prefix.bright_red().bold().to_string(),
        _ => prefix.bright_yellow().bold().to_string(),
    }
}

/// `HH:MM:SS` (UTC) for status lines.
fn timestamp(now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (hours, minutes, seconds) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Single status block for build results.
///
/// Each message replaces the previous one, so a long-running server shows
/// only the latest build outcome.
pub struct WatchStatus {
    /// Lines of previous output to clear
    last_lines: usize,
}

static WATCH_STATUS: LazyLock<Mutex<WatchStatus>> =
    LazyLock::new(|| Mutex::new(WatchStatus::new()));

impl WatchStatus {
    pub const fn new() -> Self {
        Self { last_lines: 0 }
    }

    pub fn success(&mut self, message: &str) {
        self.display(format!("{}", "✓".green()), message);
    }

    /// Error summary plus optional multi-line detail.
    pub fn error(&mut self, summary: &str, detail: &str) {
        let message = if detail.is_empty() {
            summary.to_string()
        } else {
            format!("{summary}\n{detail}")
        };
        self.display(format!("{}", "✗".red()), &message);
    }

    fn display(&mut self, symbol: String, message: &str) {
        let mut stdout = stdout().lock();

        if self.last_lines > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let lines = self.last_lines.min(u16::MAX as usize) as u16;
            execute!(stdout, cursor::MoveUp(lines)).ok();
            execute!(stdout, Clear(ClearType::FromCursorDown)).ok();
        }

        let stamp = format!("[{}]", timestamp(SystemTime::now()))
            .dimmed()
            .to_string();
        writeln!(stdout, "{stamp} {symbol} {message}").ok();
        stdout.flush().ok();

        self.last_lines = line_count(message);
    }
}

fn line_count(message: &str) -> usize {
    message.matches('\n').count() + 1
}

pub fn status_success(message: &str) {
    WATCH_STATUS.lock().success(message);
}

pub fn status_error(summary: &str, detail: &str) {
    WATCH_STATUS.lock().error(summary, detail);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_watch_status_new() {
        let status = WatchStatus::new();
        assert_eq!(status.last_lines, 0);
    }

    #[test]
    fn test_line_count() {
        assert_eq!(line_count("built serve-5280-1"), 1);
        assert_eq!(line_count("build failed\nmake: *** [html] Error 2\n  exit 2"), 3);
    }

    #[test]
    fn test_timestamp() {
        let t = UNIX_EPOCH + Duration::from_secs(3600 * 25 + 61);
        assert_eq!(timestamp(t), "01:01:01");
    }

    #[test]
    fn test_prefix_keeps_module_name() {
        assert!(colorize_prefix("build").contains("[build]"));
        assert!(colorize_prefix("custom").contains("[custom]"));
    }
}
