//! Sandbox executors
//!
//! A sandbox hosts one interpreter and turns host messages into a linear
//! event stream that ends every run with exactly one of `done`, `stopped`
//! or `error`. Two executors share the same harness:
//!
//! - [`WorkerSandbox`] runs on a dedicated OS thread with its own
//!   single-threaded runtime and posts structured messages.
//! - [`FallbackExecutor`] runs as a task on the host runtime and sends
//!   control requests as marker lines inside stdout.

mod fallback;
mod harness;
mod worker;

pub use fallback::FallbackExecutor;
pub use worker::WorkerSandbox;

use crate::interpreter::InterpreterFactory;
use crate::protocol::{Envelope, HostMessage, RunRequest, SandboxInstance};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur during sandbox operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// The executor could not be started
    #[error("Failed to launch {kind} sandbox: {message}")]
    LaunchFailed { kind: ExecutorKind, message: String },

    /// A run was submitted before the sandbox reported ready
    #[error("sandbox not ready")]
    NotReady,

    /// A run was submitted while another is in flight
    #[error("already running")]
    Busy,

    /// The sandbox has been torn down
    #[error("Sandbox terminated")]
    Terminated,

    /// The sandbox stopped accepting messages
    #[error("Sandbox channel closed")]
    ChannelClosed,
}

/// Which executor hosts the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Worker,
    Fallback,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Lifecycle of a sandbox as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    Terminated,
}

/// Common contract of the worker and fallback executors
pub trait Executor: Send {
    fn kind(&self) -> ExecutorKind;

    fn instance(&self) -> SandboxInstance;

    /// Deliver a host message
    fn post(&mut self, message: HostMessage) -> SandboxResult<()>;

    /// Raise the cooperative interrupt flag
    fn interrupt(&mut self);

    /// Tear the sandbox down; idempotent
    fn terminate(&mut self);
}

/// Host-side handle owning one executor and tracking its state
pub struct SandboxHandle {
    executor: Box<dyn Executor>,
    state: SandboxState,
    can_interrupt: bool,
}

impl SandboxHandle {
    pub fn new(executor: Box<dyn Executor>) -> Self {
        Self {
            executor,
            state: SandboxState::Uninitialized,
            can_interrupt: false,
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn kind(&self) -> ExecutorKind {
        self.executor.kind()
    }

    pub fn instance(&self) -> SandboxInstance {
        self.executor.instance()
    }

    pub fn can_interrupt(&self) -> bool {
        self.can_interrupt
    }

    pub fn is_ready(&self) -> bool {
        self.state == SandboxState::Ready
    }

    /// Ask the sandbox to initialize
    pub fn begin_init(&mut self) -> SandboxResult<()> {
        match self.state {
            SandboxState::Uninitialized => {
                self.executor.post(HostMessage::Init)?;
                self.state = SandboxState::Initializing;
                Ok(())
            }
            SandboxState::Terminated => Err(SandboxError::Terminated),
            _ => Ok(()),
        }
    }

    /// Record the sandbox's `ready` message
    pub fn mark_ready(&mut self, can_interrupt: bool) {
        if self.state == SandboxState::Initializing {
            self.state = SandboxState::Ready;
            self.can_interrupt = can_interrupt;
            debug!(instance = %self.instance(), can_interrupt, "sandbox ready");
        }
    }

    /// Send a run request; at most one may be in flight
    pub fn dispatch(&mut self, request: RunRequest) -> SandboxResult<()> {
        match self.state {
            SandboxState::Ready => {
                self.executor.post(HostMessage::Run(request))?;
                self.state = SandboxState::Busy;
                Ok(())
            }
            SandboxState::Busy => Err(SandboxError::Busy),
            SandboxState::Terminated => Err(SandboxError::Terminated),
            SandboxState::Uninitialized | SandboxState::Initializing => {
                Err(SandboxError::NotReady)
            }
        }
    }

    /// The in-flight run has ended
    pub fn mark_idle(&mut self) {
        if self.state == SandboxState::Busy {
            self.state = SandboxState::Ready;
        }
    }

    pub fn post(&mut self, message: HostMessage) -> SandboxResult<()> {
        if self.state == SandboxState::Terminated {
            return Err(SandboxError::Terminated);
        }
        self.executor.post(message)
    }

    pub fn interrupt(&mut self) {
        self.executor.interrupt();
    }

    pub fn terminate(&mut self) {
        if self.state != SandboxState::Terminated {
            debug!(instance = %self.instance(), kind = %self.kind(), "terminating sandbox");
            self.executor.terminate();
            self.state = SandboxState::Terminated;
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("instance", &self.instance())
            .field("kind", &self.kind())
            .field("state", &self.state)
            .finish()
    }
}

/// Creates executors for the orchestrator
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        kind: ExecutorKind,
        instance: SandboxInstance,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> SandboxResult<Box<dyn Executor>>;
}

/// Launches worker or fallback executors around fresh interpreters
#[derive(Clone)]
pub struct InterpreterLauncher {
    factory: Arc<dyn InterpreterFactory>,
}

impl InterpreterLauncher {
    pub fn new(factory: impl InterpreterFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl Launcher for InterpreterLauncher {
    fn launch(
        &self,
        kind: ExecutorKind,
        instance: SandboxInstance,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> SandboxResult<Box<dyn Executor>> {
        let interpreter = self.factory.create();
        Ok(match kind {
            ExecutorKind::Worker => Box::new(WorkerSandbox::spawn(instance, interpreter, events)?),
            ExecutorKind::Fallback => {
                Box::new(FallbackExecutor::spawn(instance, interpreter, events)?)
            }
        })
    }
}

#[cfg(test)]
mod tests;
