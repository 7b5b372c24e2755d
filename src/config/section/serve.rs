//! `[serve]` section configuration.
//!
//! ```toml
//! [serve]
//! interface = "127.0.0.1"     # 0.0.0.0 to serve the LAN
//! port = 5280                 # first port tried; the next 9 are fallbacks
//! watch = true                # rebuild when sources change
//! idle_timeout_secs = 0       # exit after this long without clients (0 = never)
//! restart_on_change = false   # exit with code 3 instead of rebuilding
//! exit_on_failure = false     # exit with code 1 when a build fails
//! ```

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub interface: IpAddr,
    pub port: u16,
    pub watch: bool,
    pub idle_timeout_secs: u64,
    pub restart_on_change: bool,
    pub exit_on_failure: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            interface: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 5280,
            watch: true,
            idle_timeout_secs: 0,
            restart_on_change: false,
            exit_on_failure: false,
        }
    }
}

impl ServeConfig {
    /// `None` when the idle timeout is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
