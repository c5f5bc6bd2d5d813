//! Command-line interface definitions.
//!
//! Uses clap derive API for argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Taiwan earthquake early warning aggregation and fan-out daemon.
#[derive(Parser, Debug)]
#[command(name = "eewcast")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', default_value = "config.toml")]
    pub config: PathBuf,

    /// Enable verbose debug logging
    #[arg(long)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,
}
