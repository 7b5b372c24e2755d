//! Command-line interface definitions.

use clap::{ArgGroup, ColorChoice, Parser, Subcommand};
use std::path::PathBuf;

/// Live-reloading document server with push notifications
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Config file path (default: livesite.toml)
    #[arg(short = 'C', long, global = true, default_value = "livesite.toml", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// Enable verbose output for debugging
    #[arg(short = 'V', long, global = true)]
    pub verbose: bool,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build the site and serve it, rebuilding on change
    #[command(visible_alias = "s")]
    Serve {
        /// Network interface to bind (e.g., 127.0.0.1, 0.0.0.0)
        #[arg(short, long)]
        interface: Option<std::net::IpAddr>,

        /// Port number to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable file watching for auto-rebuild
        #[arg(short, long, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true", require_equals = false)]
        watch: Option<bool>,

        /// Exit with code 3 when sources change after the first build
        #[arg(long, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true", require_equals = false)]
        restart_on_change: Option<bool>,

        /// Exit with code 1 when a build fails
        #[arg(long, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true", require_equals = false)]
        exit_on_failure: Option<bool>,
    },

    /// Bump notification counters, waking watchers of a running server
    #[command(visible_alias = "n")]
    Notify {
        /// Notification keys, e.g. `solutions:/intro/`
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Show or hide the solutions of a page
    #[command(group(ArgGroup::new("visibility").required(true).args(["show", "hide"])))]
    Solutions {
        /// Page path, e.g. `/intro/`
        page: String,

        #[arg(long)]
        show: bool,

        #[arg(long)]
        hide: bool,
    },
}

impl Cli {
    pub const fn is_serve(&self) -> bool {
        matches!(self.command, Commands::Serve { .. })
    }
}
