//! eewcast - Taiwan earthquake early warning aggregation and fan-out.
//!
//! Ingests EEW bulletins from the upstream provider over WebSocket or HTTP
//! polling, tracks alert lifecycles, computes per-region expected intensity
//! and wave arrivals, and fans enriched alerts out to the enabled notifiers.

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

mod cli;
mod config;
mod eew;
mod errors;
mod ingest;
mod intensity;
mod location;
mod models;
mod notifiers;
mod notify;
mod pool;
mod runtime;
mod supervisor;
mod tracker;
mod wave;
mod ws;

use cli::Cli;
use config::{Config, LogFormat};
use runtime::Runtime;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).context("failed to load configuration")?;
    init_tracing(&config, cli.verbose, cli.quiet);

    // An API key selects the WebSocket transport.
    let api_key = std::env::var("API_KEY").ok().filter(|key| !key.is_empty());

    let runtime =
        Runtime::new(config, api_key).context("failed to initialize the runtime")?;

    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(runtime.run())
        .context("runtime failed")
}

/// Initialize tracing subscriber.
fn init_tracing(config: &Config, verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose || config.debug_mode {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    match config.log.format {
        LogFormat::Full => builder.init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}
