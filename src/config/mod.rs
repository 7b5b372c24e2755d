//! Site configuration management for `livesite.toml`.
//!
//! # Module Structure
//!
//! ```text
//! config/
//! ├── section/       # Configuration section definitions
//! │   ├── build      # [build]
//! │   ├── events     # [events]
//! │   ├── serve      # [serve]
//! │   └── store      # [store]
//! ├── types/         # Utility types
//! │   ├── error      # ConfigError, ConfigDiagnostics
//! │   └── handle     # Global config handle
//! └── mod.rs         # SiteConfig (this file)
//! ```
//!
//! Relative paths are resolved against the directory holding the config
//! file. Without a config file every section takes its defaults and the
//! current directory is the root.

pub mod section;
pub mod types;
mod util;

use util::find_config_file;

pub use section::{BuildConfig, EventsConfig, ServeConfig, StoreConfig};
pub use types::{ConfigDiagnostics, ConfigError, cfg, init_config};

use crate::{
    cli::{Cli, Commands},
    log,
    utils::path::{normalize_path, resolve_under},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Root configuration structure representing livesite.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Absolute path to the config file (may not exist)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Project root directory, parent of the config file
    #[serde(skip)]
    pub root: PathBuf,

    #[serde(default)]
    pub serve: ServeConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

impl SiteConfig {
    /// Load configuration for `cli`, searching upward from cwd for the file.
    pub fn load(cli: &Cli) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current working directory")?;

        let mut config = match find_config_file(&cli.config) {
            Some(path) => Self::from_path(&path)?,
            None => {
                log!("config"; "{} not found, using defaults", cli.config.display());
                Self {
                    config_path: cwd.join(&cli.config),
                    ..Self::default()
                }
            }
        };

        let root = config
            .config_path
            .parent()
            .map_or_else(|| cwd.clone(), Path::to_path_buf);
        config.normalize_paths(&root);
        config.apply_command_options(cli);
        config.validate(cli.is_serve())?;

        Ok(config)
    }

    /// Load configuration from file path with unknown field detection.
    fn from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (mut config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            Self::print_unknown_fields_warning(&ignored, path);
        }

        config.config_path = normalize_path(path);
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    fn print_unknown_fields_warning(fields: &[String], path: &Path) {
        let display_path = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());
        log!("warning"; "unknown fields in {} are ignored:", display_path);
        for field in fields {
            eprintln!("- {}", field);
        }
    }

    /// Resolve every configured path against `root`.
    fn normalize_paths(&mut self, root: &Path) {
        self.root = normalize_path(root);
        self.build.root = resolve_under(&self.build.root, &self.root);
        self.build.sources = self
            .build
            .sources
            .iter()
            .map(|p| resolve_under(p, &self.root))
            .collect();
        self.store.path = resolve_under(&self.store.path, &self.root);
    }

    fn apply_command_options(&mut self, cli: &Cli) {
        if let Commands::Serve {
            interface,
            port,
            watch,
            restart_on_change,
            exit_on_failure,
        } = &cli.command
        {
            Self::update_option(&mut self.serve.interface, interface.as_ref());
            Self::update_option(&mut self.serve.port, port.as_ref());
            Self::update_option(&mut self.serve.watch, watch.as_ref());
            Self::update_option(&mut self.serve.restart_on_change, restart_on_change.as_ref());
            Self::update_option(&mut self.serve.exit_on_failure, exit_on_failure.as_ref());
        }
    }

    /// Update config option if CLI value is provided.
    fn update_option<T: Clone>(config_option: &mut T, cli_option: Option<&T>) {
        if let Some(option) = cli_option {
            *config_option = option.clone();
        }
    }

    /// Collect every validation error; `[build]` only matters when serving.
    pub fn validate(&self, serving: bool) -> Result<(), ConfigError> {
        let mut diag = ConfigDiagnostics::new();

        if serving {
            self.build.validate(&mut diag);
        }
        self.events.validate(&mut diag);

        diag.print_warnings();
        diag.into_result().map_err(ConfigError::Diagnostics)
    }
}

/// Parse config text, panicking on unknown fields to catch typos in tests.
#[cfg(test)]
pub fn test_parse_config(content: &str) -> SiteConfig {
    let (parsed, ignored) = SiteConfig::parse_with_ignored(content).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}
