//! Run outcome reporting

use crate::interrupt::StopReason;
use crate::protocol::RunToken;
use crate::sandbox::ExecutorKind;
use std::fmt;
use std::time::Duration;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The program finished on its own
    Completed,
    /// The run was stopped before finishing
    Stopped(StopReason),
    /// The interpreter or the sandbox reported an error
    Failed(String),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            Self::Stopped(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Process exit code for command line front ends
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed(_) => 1,
            Self::Stopped(_) => 130,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Stopped(reason) => write!(f, "stopped ({})", reason),
            Self::Failed(message) => write!(f, "failed: {}", message),
        }
    }
}

/// Summary of one finalized run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub token: RunToken,
    pub outcome: RunOutcome,
    /// Executor the request was dispatched to; `None` if it never was
    pub executor: Option<ExecutorKind>,
    /// Accounted running time, excluding input waits and sleeps
    pub running_time: Duration,
    /// Everything shown for this run: output, prompts, answers and notices
    pub transcript: String,
}
