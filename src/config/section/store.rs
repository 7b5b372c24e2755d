//! `[store]` section configuration.
//!
//! ```toml
//! [store]
//! path = "state.sqlite"       # relative to the config file
//! poll_interval_ms = 2000     # re-read watched keys for external writes (0 = off)
//! busy_timeout_ms = 5000
//! ```

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::store::StoreSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub poll_interval_ms: u64,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("state.sqlite"),
            poll_interval_ms: 2000,
            busy_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    /// `None` disables the dispatcher's polling fallback.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_parse_config;

    #[test]
    fn test_store_config() {
        let config = test_parse_config("[store]\npath = \"db/live.sqlite\"\npoll_interval_ms = 0");
        assert_eq!(config.store.path, PathBuf::from("db/live.sqlite"));
        assert_eq!(config.store.poll_interval(), None);
        assert_eq!(config.store.settings(), StoreSettings::default());
    }

    #[test]
    fn test_store_config_defaults() {
        let config = test_parse_config("");
        assert_eq!(config.store.poll_interval(), Some(Duration::from_secs(2)));
    }
}
