//! File-based configuration loading

use super::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use std::fs;
use std::path::Path;

/// Load configuration from a file
///
/// Supports JSON and TOML formats based on file extension.
/// Returns default config if file doesn't exist.
pub fn load_from_file(path: &Path) -> RunnerResult<RunnerConfig> {
    if !path.exists() {
        return Ok(RunnerConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| {
        RunnerError::config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let config: RunnerConfig = match path.extension().and_then(|s| s.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|e| {
            RunnerError::config(format!(
                "Failed to parse TOML config '{}': {}",
                path.display(),
                e
            ))
        })?,
        _ => serde_json::from_str(&content).map_err(|e| {
            RunnerError::config(format!(
                "Failed to parse JSON config '{}': {}",
                path.display(),
                e
            ))
        })?,
    };

    Ok(config)
}
