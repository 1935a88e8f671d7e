//! Scriptbox command-line runner
//!
//! Runs a Python script in an interruptible sandbox. Output streams to the
//! terminal, `input()` prompts read from stdin, and plots are reported or
//! saved as PNG files.
//!
//! ```bash
//! scriptbox run script.py --timeout 30s
//! scriptbox run script.py --plot-dir plots/
//! scriptbox instrument script.py
//! ```
//!
//! Ctrl+C stops the current script; a second Ctrl+C exits at once.

mod args;
mod commands;
mod signal_handler;
mod terminal;

use args::{Cli, Commands};
use clap::Parser;
use colored::*;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Instrument(args) => commands::instrument::execute(args).await,
    };

    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr; `--verbose` forces debug, otherwise RUST_LOG or warnings only
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
