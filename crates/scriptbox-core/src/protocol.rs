//! Host ↔ sandbox message protocol
//!
//! Every run-scoped message carries the [`RunToken`] of the run that
//! produced it, and every message delivered to the host is wrapped in an
//! [`Envelope`] naming the sandbox instance it came from. Together they
//! let the orchestrator drop anything left over from a superseded run or
//! a terminated sandbox.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing identifier of a run
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunToken(u64);

impl RunToken {
    /// Token carried by messages that belong to no run
    pub const NONE: RunToken = RunToken(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The token that follows this one
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one launched sandbox; never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxInstance(u64);

impl SandboxInstance {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sandbox-{}", self.0)
    }
}

/// An encoded plot image, normally a `data:image/png;base64,` URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlotImage(String);

const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

impl PlotImage {
    pub fn new(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    /// Wrap raw base64 PNG bytes in a data URI
    pub fn from_png_base64(encoded: &str) -> Self {
        Self(format!("{}{}", PNG_DATA_URI_PREFIX, encoded))
    }

    pub fn data(&self) -> &str {
        &self.0
    }

    /// The base64 payload if this is a PNG data URI
    pub fn png_base64(&self) -> Option<&str> {
        self.0.strip_prefix(PNG_DATA_URI_PREFIX)
    }
}

/// A program submitted to the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub token: RunToken,
    /// Program text, instrumented unless `instrumented` is false
    pub code: String,
    pub instrumented: bool,
    pub needs_graphics: bool,
}

/// Messages from the host to the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Prepare the interpreter and report `ready`
    Init,
    /// Execute a program
    Run(RunRequest),
    /// Answer to the pending input request
    InputResponse { value: String },
    /// The pending input request will never be answered
    InputClosed,
    /// Raise the cooperative interrupt flag
    Stop,
}

/// Messages from the sandbox to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxMessage {
    Ready { can_interrupt: bool },
    Log { message: String },
    Stdout { token: RunToken, data: String },
    Stderr { token: RunToken, data: String },
    InputRequest { token: RunToken, prompt: String },
    Plot { token: RunToken, data: PlotImage },
    SleepBegin { token: RunToken },
    SleepEnd { token: RunToken },
    Done { token: RunToken },
    Stopped { token: RunToken },
    /// `token` is [`RunToken::NONE`] for failures outside a run (init)
    Error { token: RunToken, message: String },
}

/// Output produced on behalf of one run, as seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Text(String),
    ErrorText(String),
    InputRequest(String),
    PlotReady(PlotImage),
    SleepBegin,
    SleepEnd,
    Done,
    Stopped,
    Error(String),
}

impl OutputEvent {
    /// Whether this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Stopped | Self::Error(_))
    }
}

/// A sandbox message split into lifecycle and run-scoped parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxSignal {
    Ready { can_interrupt: bool },
    Log(String),
    Run { token: RunToken, event: OutputEvent },
}

impl From<SandboxMessage> for SandboxSignal {
    fn from(message: SandboxMessage) -> Self {
        use OutputEvent as E;
        let (token, event) = match message {
            SandboxMessage::Ready { can_interrupt } => return Self::Ready { can_interrupt },
            SandboxMessage::Log { message } => return Self::Log(message),
            SandboxMessage::Stdout { token, data } => (token, E::Text(data)),
            SandboxMessage::Stderr { token, data } => (token, E::ErrorText(data)),
            SandboxMessage::InputRequest { token, prompt } => (token, E::InputRequest(prompt)),
            SandboxMessage::Plot { token, data } => (token, E::PlotReady(data)),
            SandboxMessage::SleepBegin { token } => (token, E::SleepBegin),
            SandboxMessage::SleepEnd { token } => (token, E::SleepEnd),
            SandboxMessage::Done { token } => (token, E::Done),
            SandboxMessage::Stopped { token } => (token, E::Stopped),
            SandboxMessage::Error { token, message } => (token, E::Error(message)),
        };
        Self::Run { token, event }
    }
}

/// A sandbox message tagged with the instance that sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub instance: SandboxInstance,
    pub message: SandboxMessage,
}
