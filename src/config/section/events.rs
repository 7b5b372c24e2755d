//! `[events]` section configuration.
//!
//! ```toml
//! [events]
//! tick_ms = 1000              # re-read period of store-backed observables
//! keepalive_ms = 1000         # blank line on idle watch streams
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigDiagnostics;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub tick_ms: u64,
    pub keepalive_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            keepalive_ms: 1000,
        }
    }
}

impl EventsConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn validate(&self, diag: &mut ConfigDiagnostics) {
        if self.tick_ms == 0 {
            diag.error("events.tick_ms", "must be greater than 0");
        }
        if self.keepalive_ms == 0 {
            diag.error("events.keepalive_ms", "must be greater than 0");
        }
    }
}
