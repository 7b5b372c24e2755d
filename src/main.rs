//! livesite - a live-reloading document server with push notifications.

mod build;
mod cli;
mod config;
mod core;
mod embed;
mod events;
mod logger;
mod store;
mod utils;

use anyhow::Result;
use clap::{ColorChoice, Parser};
use cli::{Cli, Commands};
use config::{SiteConfig, init_config};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::set_verbose(cli.verbose);

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }

    core::setup_shutdown_handler()?;
    let config = init_config(SiteConfig::load(&cli)?);

    match &cli.command {
        Commands::Serve { .. } => {
            cli::serve::serve()?;
            std::process::exit(core::exit_code());
        }
        Commands::Notify { keys } => cli::store::notify(&config, keys).map(|_| ()),
        Commands::Solutions { page, show, .. } => cli::store::set_solutions(&config, page, *show),
    }
}
