//! Runner configuration
//!
//! Precedence, lowest to highest: built-in defaults, config file,
//! environment, then explicit overrides from the caller (CLI flags).

pub mod defaults;
mod env_loader;
mod file_loader;

pub use env_loader::{
    ENV_EXEC_TIMEOUT_MS, ENV_EXECUTOR, ENV_INIT_TIMEOUT_MS, ENV_PYTHON, ENV_STOP_GRACE_MS,
    apply_env, apply_env_with,
};
pub use file_loader::load_from_file;

use crate::error::{RunnerError, RunnerResult};
use crate::instrument::InstrumentOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which sandbox executor to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorPreference {
    /// Worker thread, falling back to the host runtime if it cannot start
    #[default]
    Auto,
    /// Worker thread only
    Worker,
    /// Host runtime only
    Fallback,
}

impl fmt::Display for ExecutorPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Worker => write!(f, "worker"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

impl FromStr for ExecutorPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "worker" => Ok(Self::Worker),
            "fallback" | "inline" => Ok(Self::Fallback),
            other => Err(format!(
                "unknown executor '{}' (expected auto, worker or fallback)",
                other
            )),
        }
    }
}

/// External interpreter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Interpreter executable
    pub program: String,
    /// Extra arguments placed before the bootstrap
    pub args: Vec<String>,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            program: defaults::python::PROGRAM.to_string(),
            args: Vec::new(),
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Accounted execution budget per run; zero disables the limit
    #[serde(with = "humantime_serde")]
    pub exec_timeout: Duration,
    /// Wait between a cooperative stop and hard termination
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Wait for a worker sandbox to report ready
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,
    /// Executor selection
    pub executor: ExecutorPreference,
    /// Indentation width used by the instrumenter
    pub indent_width: usize,
    /// Interpreter settings
    pub python: PythonConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            exec_timeout: defaults::limits::exec_timeout(),
            stop_grace: defaults::limits::stop_grace(),
            init_timeout: defaults::limits::init_timeout(),
            executor: ExecutorPreference::default(),
            indent_width: defaults::instrumentation::INDENT_WIDTH,
            python: PythonConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> RunnerResult<Self> {
        let mut config = match path {
            Some(path) => load_from_file(path)?,
            None => Self::default(),
        };
        apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// The execution limit, or `None` when disabled
    pub fn time_limit(&self) -> Option<Duration> {
        (!self.exec_timeout.is_zero()).then_some(self.exec_timeout)
    }

    /// Options for the instrumenter
    pub fn instrument_options(&self) -> InstrumentOptions {
        InstrumentOptions {
            indent_width: self.indent_width,
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> RunnerResult<()> {
        if self.stop_grace.is_zero() {
            return Err(RunnerError::config("stop_grace must be greater than zero"));
        }
        if self.init_timeout.is_zero() {
            return Err(RunnerError::config("init_timeout must be greater than zero"));
        }
        if !(1..=16).contains(&self.indent_width) {
            return Err(RunnerError::config(format!(
                "indent_width must be between 1 and 16, got {}",
                self.indent_width
            )));
        }
        if self.python.program.trim().is_empty() {
            return Err(RunnerError::config("python.program must not be empty"));
        }
        Ok(())
    }
}
