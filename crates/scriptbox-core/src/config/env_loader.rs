//! Environment variable overrides
//!
//! Recognised variables use the `SCRIPTBOX_` prefix. Durations are given
//! in milliseconds.

use super::{ExecutorPreference, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};
use std::time::Duration;

pub const ENV_EXEC_TIMEOUT_MS: &str = "SCRIPTBOX_EXEC_TIMEOUT_MS";
pub const ENV_STOP_GRACE_MS: &str = "SCRIPTBOX_STOP_GRACE_MS";
pub const ENV_INIT_TIMEOUT_MS: &str = "SCRIPTBOX_INIT_TIMEOUT_MS";
pub const ENV_EXECUTOR: &str = "SCRIPTBOX_EXECUTOR";
pub const ENV_PYTHON: &str = "SCRIPTBOX_PYTHON";

/// Apply overrides from the process environment
pub fn apply_env(config: &mut RunnerConfig) -> RunnerResult<()> {
    apply_env_with(config, |key| std::env::var(key).ok())
}

/// Apply overrides using a custom variable lookup
pub fn apply_env_with<F>(config: &mut RunnerConfig, lookup: F) -> RunnerResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_EXEC_TIMEOUT_MS) {
        config.exec_timeout = parse_millis(ENV_EXEC_TIMEOUT_MS, &value)?;
    }
    if let Some(value) = lookup(ENV_STOP_GRACE_MS) {
        config.stop_grace = parse_millis(ENV_STOP_GRACE_MS, &value)?;
    }
    if let Some(value) = lookup(ENV_INIT_TIMEOUT_MS) {
        config.init_timeout = parse_millis(ENV_INIT_TIMEOUT_MS, &value)?;
    }
    if let Some(value) = lookup(ENV_EXECUTOR) {
        config.executor = value
            .parse::<ExecutorPreference>()
            .map_err(|e| RunnerError::config(format!("Invalid {} value: {}", ENV_EXECUTOR, e)))?;
    }
    if let Some(value) = lookup(ENV_PYTHON) {
        if !value.trim().is_empty() {
            config.python.program = value.trim().to_string();
        }
    }
    Ok(())
}

fn parse_millis(key: &str, value: &str) -> RunnerResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| RunnerError::config(format!("Invalid {} value: '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunnerConfig::default();
        apply_env_with(
            &mut config,
            lookup(&[
                (ENV_EXEC_TIMEOUT_MS, "2500"),
                (ENV_STOP_GRACE_MS, "100"),
                (ENV_EXECUTOR, "Fallback"),
                (ENV_PYTHON, "python3.11"),
            ]),
        )
        .unwrap();

        assert_eq!(config.exec_timeout, Duration::from_millis(2500));
        assert_eq!(config.stop_grace, Duration::from_millis(100));
        assert_eq!(config.executor, ExecutorPreference::Fallback);
        assert_eq!(config.python.program, "python3.11");
        assert_eq!(config.init_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let mut config = RunnerConfig::default();
        let err = apply_env_with(&mut config, lookup(&[(ENV_INIT_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_INIT_TIMEOUT_MS));
    }

    #[test]
    fn test_blank_python_is_ignored() {
        let mut config = RunnerConfig::default();
        apply_env_with(&mut config, lookup(&[(ENV_PYTHON, "  ")])).unwrap();
        assert_eq!(config.python.program, "python3");
    }
}
