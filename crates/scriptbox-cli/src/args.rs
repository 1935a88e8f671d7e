//! CLI argument definitions using clap
//!
//! - scriptbox run script.py                 # run with a system python3
//! - scriptbox run script.py --timeout 30s   # custom execution budget
//! - scriptbox instrument script.py          # show the rewritten program

use clap::{Args, Parser, Subcommand, ValueEnum};
use scriptbox_core::ExecutorPreference;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "scriptbox")]
#[command(about = "Run Python scripts in an interruptible sandbox")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a Python file; Ctrl+C stops it
    Run(RunArgs),

    /// Print the instrumented form of a Python file
    Instrument(InstrumentArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Python source file
    pub file: PathBuf,

    /// Execution time limit, e.g. `10s`, `1m 30s`; `0s` disables it
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Executor to host the interpreter (auto, worker, fallback)
    #[arg(long)]
    pub executor: Option<ExecutorPreference>,

    /// Python interpreter to use
    #[arg(long)]
    pub python: Option<String>,

    /// Directory to write PNG plots to
    #[arg(long)]
    pub plot_dir: Option<PathBuf>,

    /// Configuration file (JSON or TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interpreter implementation
    #[arg(long, value_enum, default_value_t = InterpreterChoice::Python)]
    pub interpreter: InterpreterChoice,
}

#[derive(Args, Debug)]
pub struct InstrumentArgs {
    /// Python source file
    pub file: PathBuf,

    /// Configuration file (JSON or TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpreterChoice {
    /// System Python
    Python,
    /// Built-in line interpreter for a small Python subset
    Scripted,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}
