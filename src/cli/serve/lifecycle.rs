//! Server lifecycle management.

use crate::{core::request_shutdown, events::EventHub, log};
use anyhow::Result;
use std::{
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tiny_http::Server;

/// Maximum number of port binding attempts.
const MAX_PORT_RETRIES: u16 = 10;

/// Bind to the specified interface and port, with automatic port retry.
pub fn bind_with_retry(
    interface: std::net::IpAddr,
    base_port: u16,
) -> Result<(Server, SocketAddr)> {
    let mut last_err = None;
    for offset in 0..MAX_PORT_RETRIES {
        let Some(port) = base_port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::new(interface, port);

        match Server::http(addr) {
            Ok(server) => {
                if offset > 0 {
                    log!("serve"; "port {} in use, using {} instead", base_port, port);
                }
                // port 0 asks the OS for any free port
                let addr = server.server_addr().to_ip().unwrap_or(addr);
                return Ok((server, addr));
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(anyhow::anyhow!(
        "Failed to bind after {} attempts (ports {}-{}): {}",
        MAX_PORT_RETRIES,
        base_port,
        base_port.saturating_add(MAX_PORT_RETRIES - 1),
        last_err.map_or_else(|| "port range exhausted".to_string(), |e| e.to_string())
    ))
}

/// Shut the server down once no client has been connected for `timeout`.
pub fn spawn_idle_watchdog(hub: Arc<EventHub>, timeout: Duration) -> std::io::Result<JoinHandle<()>> {
    let check = (timeout / 4).clamp(Duration::from_millis(100), Duration::from_secs(5));
    thread::Builder::new().name("idle".into()).spawn(move || {
        while !crate::core::is_shutdown() {
            if hub.idle_for() >= timeout {
                request_shutdown(0, &format!("no clients for {}s", timeout.as_secs()));
                return;
            }
            thread::sleep(check);
        }
    })
}

/// Wait for a background thread to finish (max 2 seconds).
pub fn wait_for_thread(handle: JoinHandle<()>) {
    for _ in 0..40 {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
}
