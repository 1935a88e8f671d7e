//! Scriptbox core library
//!
//! Runs untrusted user scripts inside a replaceable sandbox while the host
//! stays responsive. The pieces fit together like this:
//!
//! - [`instrument`] rewrites blocking `input()`/`sleep()` call-sites into
//!   awaitable host calls and wraps the program in an async entry point.
//! - [`sandbox`] hosts an [`interpreter::Interpreter`] either on a dedicated
//!   worker thread or on the host runtime (the fallback path).
//! - [`orchestrator`] owns the run lifecycle: tokens, the pausable execution
//!   timer, cooperative stop with a grace period, and hard termination.
//! - [`ui`] is the narrow surface a front end implements to show output,
//!   prompts and images.

pub mod codec;
pub mod config;
pub mod error;
pub mod input;
pub mod instrument;
pub mod interpreter;
pub mod interrupt;
pub mod orchestrator;
pub mod protocol;
pub mod sandbox;
pub mod timer;
pub mod ui;

pub use config::{ExecutorPreference, PythonConfig, RunnerConfig};
pub use error::{RunnerError, RunnerResult};
pub use input::{InputReply, InputResolver};
pub use instrument::{InstrumentOptions, Instrumented, instrument};
pub use interpreter::{
    ExecError, Host, Interpreter, InterpreterFactory, OutputSink, Program, PythonInterpreter,
    ScriptedInterpreter,
};
pub use interrupt::{InterruptFlag, StopReason};
pub use orchestrator::{Orchestrator, RunOutcome, RunReport, Session, SessionHandle};
pub use protocol::{PlotImage, RunToken, SandboxInstance};
pub use sandbox::{ExecutorKind, InterpreterLauncher, Launcher, SandboxError, SandboxResult};
pub use ui::{OutputStream, RunUi};
