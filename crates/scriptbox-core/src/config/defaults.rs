//! Default values for runner configuration
//!
//! All values can be overridden via a config file, `SCRIPTBOX_*`
//! environment variables or command-line flags.

use std::time::Duration;

/// Default execution time limits
pub mod limits {
    use super::*;

    /// Default accounted execution budget per run (10 seconds)
    pub const EXEC_TIMEOUT_MS: u64 = 10_000;

    /// Grace period between a cooperative stop and hard termination (1.5 seconds)
    pub const STOP_GRACE_MS: u64 = 1_500;

    /// Time allowed for a worker sandbox to report ready (15 seconds)
    pub const INIT_TIMEOUT_MS: u64 = 15_000;

    /// Get execution timeout as Duration
    pub fn exec_timeout() -> Duration {
        Duration::from_millis(EXEC_TIMEOUT_MS)
    }

    /// Get stop grace period as Duration
    pub fn stop_grace() -> Duration {
        Duration::from_millis(STOP_GRACE_MS)
    }

    /// Get sandbox init timeout as Duration
    pub fn init_timeout() -> Duration {
        Duration::from_millis(INIT_TIMEOUT_MS)
    }
}

/// Default instrumentation settings
pub mod instrumentation {
    /// Spaces used for one indentation level, and for each expanded tab
    pub const INDENT_WIDTH: usize = 4;
}

/// Default interpreter settings
pub mod python {
    /// Interpreter executable looked up on PATH
    pub const PROGRAM: &str = "python3";
}
