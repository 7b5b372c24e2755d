//! Process-wide shutdown state for serve mode.
//!
//! Any thread may request shutdown with an exit code: Ctrl+C (0), the
//! terminate endpoint (0), the idle timeout (0), a failed build with
//! `exit_on_failure` (1) or a source change with `restart_on_change` (3).
//! The first request wins; later ones only log.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use tiny_http::Server;

/// Exit code asking a supervisor to restart the process.
pub const EXIT_RESTART: i32 = 3;

/// Exit code for a build failure with `exit_on_failure`.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug)]
pub struct ShutdownState {
    requested: AtomicBool,
    code: AtomicI32,
}

impl ShutdownState {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            code: AtomicI32::new(0),
        }
    }

    /// Returns `true` if this call was the first request.
    pub fn request(&self, code: i32) -> bool {
        let first = self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.code.store(code, Ordering::SeqCst);
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn code(&self) -> i32 {
        self.code.load(Ordering::SeqCst)
    }
}

static SHUTDOWN: ShutdownState = ShutdownState::new();

/// HTTP server reference for graceful shutdown
static SERVER: OnceLock<Arc<Server>> = OnceLock::new();

/// Setup the global Ctrl+C handler. Call once at program start
///
/// Before `register_server()` the process exits immediately since there
/// is nothing to drain.
pub fn setup_shutdown_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        if SERVER.get().is_none() {
            std::process::exit(0);
        }
        request_shutdown(0, "interrupted");
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {}", e))
}

/// Register the HTTP server for graceful shutdown
///
/// Call this after binding the server, before entering the request loop
pub fn register_server(server: Arc<Server>) {
    let _ = SERVER.set(server);
}

/// Request process shutdown with `code`, unblocking the request loop.
pub fn request_shutdown(code: i32, reason: &str) {
    if SHUTDOWN.request(code) {
        crate::log!("serve"; "shutting down: {}", reason);
        if let Some(server) = SERVER.get() {
            server.unblock();
        }
    } else {
        crate::debug!("serve"; "shutdown already requested, ignoring: {}", reason);
    }
}

/// Check if shutdown has been requested
///
/// Relaxed ordering: worst case a loop runs one more iteration.
pub fn is_shutdown() -> bool {
    SHUTDOWN.is_requested()
}

/// Exit code chosen by the first shutdown request.
pub fn exit_code() -> i32 {
    SHUTDOWN.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_wins() {
        let state = ShutdownState::new();
        assert!(!state.is_requested());
        assert_eq!(state.code(), 0);

        assert!(state.request(EXIT_RESTART));
        assert!(!state.request(EXIT_FAILURE));
        assert!(state.is_requested());
        assert_eq!(state.code(), EXIT_RESTART);
    }

    #[test]
    fn test_concurrent_requests_pick_one_code() {
        let state = Arc::new(ShutdownState::new());
        let handles: Vec<_> = (1..=8)
            .map(|code| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || state.request(code))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!((1..=8).contains(&state.code()));
    }
}
