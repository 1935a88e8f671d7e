//! Interpreter collaborator interface
//!
//! The sandbox owns one [`Interpreter`] and drives it through this trait.
//! During [`Interpreter::execute`] the interpreter calls back into the
//! sandbox through a [`Host`] for the operations that must not block the
//! sandbox: input, sleep and figure display.

mod python;
mod scripted;

pub use python::PythonInterpreter;
pub use scripted::ScriptedInterpreter;

use crate::interrupt::InterruptFlag;
use crate::protocol::{PlotImage, RunRequest};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors raised while executing a program
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// The cooperative interrupt was observed
    #[error("KeyboardInterrupt")]
    Interrupted,

    /// The program raised; the message is shown verbatim
    #[error("{0}")]
    Runtime(String),

    /// The interpreter cannot be used at all
    #[error("Interpreter unavailable: {0}")]
    Unavailable(String),

    /// The host has no more input to give
    #[error("EOFError: EOF when reading a line")]
    EndOfInput,

    /// Communication with the interpreter failed
    #[error("Interpreter I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A program as handed to the interpreter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub code: String,
    /// Whether `code` defines the asynchronous entry point to await
    pub instrumented: bool,
    pub needs_graphics: bool,
}

impl Program {
    pub fn entry_point(&self) -> Option<&'static str> {
        self.instrumented.then_some(crate::instrument::ENTRY_POINT)
    }
}

impl From<&RunRequest> for Program {
    fn from(request: &RunRequest) -> Self {
        Self {
            code: request.code.clone(),
            instrumented: request.instrumented,
            needs_graphics: request.needs_graphics,
        }
    }
}

/// Output stream of the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Where the interpreter writes program output
#[derive(Clone)]
pub struct OutputSink {
    write: Arc<dyn Fn(Stream, &str) + Send + Sync>,
}

impl OutputSink {
    pub fn new(write: impl Fn(Stream, &str) + Send + Sync + 'static) -> Self {
        Self {
            write: Arc::new(write),
        }
    }

    /// A sink that drops everything
    pub fn discard() -> Self {
        Self::new(|_, _| {})
    }

    pub fn stdout(&self, text: &str) {
        if !text.is_empty() {
            (self.write)(Stream::Stdout, text);
        }
    }

    pub fn stderr(&self, text: &str) {
        if !text.is_empty() {
            (self.write)(Stream::Stderr, text);
        }
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::discard()
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// Services the sandbox offers a running program
#[async_trait]
pub trait Host: Send {
    /// Ask the user for a line; suspends until answered or interrupted
    async fn input(&mut self, prompt: &str) -> Result<String, ExecError>;

    /// Sleep without blocking the sandbox; interruptible
    async fn sleep(&mut self, duration: Duration) -> Result<(), ExecError>;

    /// Announce a sleep the interpreter performs itself
    fn sleep_begin(&mut self);

    fn sleep_end(&mut self);

    /// Publish figures from an explicit show call, in order
    fn show(&mut self, figures: Vec<PlotImage>) {
        for figure in figures {
            self.emit_plot(figure);
        }
    }

    fn emit_plot(&mut self, image: PlotImage);
}

/// An interpreter that runs inside a sandbox
#[async_trait]
pub trait Interpreter: Send {
    fn name(&self) -> &str;

    /// Prepare for execution; called once per sandbox
    async fn initialize(&mut self) -> Result<(), ExecError>;

    /// Whether the interpreter observes the cooperative interrupt flag
    fn supports_interrupt(&self) -> bool;

    fn install_output_sink(&mut self, sink: OutputSink);

    fn install_interrupt_flag(&mut self, flag: InterruptFlag);

    /// Receive the token cancelled when the sandbox is torn down
    fn install_kill_switch(&mut self, _kill: CancellationToken) {}

    /// Load plotting support before a program that needs it
    async fn load_graphics(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn execute(&mut self, program: &Program, host: &mut dyn Host) -> Result<(), ExecError>;

    /// Figures created but not yet shown
    fn take_figures(&mut self) -> Vec<PlotImage> {
        Vec::new()
    }

    /// Forget all graphics state before the next run
    fn reset_graphics(&mut self) {}

    /// Release resources immediately; the sandbox is going away
    fn kill(&mut self) {}
}

/// Creates a fresh interpreter for each sandbox
pub trait InterpreterFactory: Send + Sync {
    fn create(&self) -> Box<dyn Interpreter>;
}

impl<F> InterpreterFactory for F
where
    F: Fn() -> Box<dyn Interpreter> + Send + Sync,
{
    fn create(&self) -> Box<dyn Interpreter> {
        self()
    }
}
