//! Command-line interface module.

mod args;
pub mod serve;
pub mod store;

pub use args::{Cli, Commands};
