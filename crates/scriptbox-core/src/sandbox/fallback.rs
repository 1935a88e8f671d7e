use super::harness::{ControlChannel, Emitter, Harness};
use super::{Executor, ExecutorKind, SandboxError, SandboxResult};
use crate::interpreter::Interpreter;
use crate::interrupt::InterruptFlag;
use crate::protocol::{Envelope, HostMessage, SandboxInstance};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs the harness as a task on the host runtime
///
/// Used when a worker sandbox cannot be started. Control requests travel
/// as marker lines inside stdout, exactly as an interpreter without a
/// structured channel would send them.
pub struct FallbackExecutor {
    instance: SandboxInstance,
    inbox: Option<mpsc::UnboundedSender<HostMessage>>,
    interrupt: InterruptFlag,
    kill: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FallbackExecutor {
    pub fn spawn(
        instance: SandboxInstance,
        interpreter: Box<dyn Interpreter>,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> SandboxResult<Self> {
        let handle = Handle::try_current().map_err(|e| SandboxError::LaunchFailed {
            kind: ExecutorKind::Fallback,
            message: e.to_string(),
        })?;

        let (inbox, rx) = mpsc::unbounded_channel();
        let interrupt = InterruptFlag::new();
        let kill = CancellationToken::new();
        let emitter = Emitter::new(instance, events, ControlChannel::Text);
        let harness = Harness::new(interpreter, emitter, interrupt.clone(), kill.clone());
        let task = handle.spawn(harness.serve(rx));

        debug!(%instance, "fallback executor started");
        Ok(Self {
            instance,
            inbox: Some(inbox),
            interrupt,
            kill,
            task: Some(task),
        })
    }
}

impl Executor for FallbackExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Fallback
    }

    fn instance(&self) -> SandboxInstance {
        self.instance
    }

    fn post(&mut self, message: HostMessage) -> SandboxResult<()> {
        let inbox = self.inbox.as_ref().ok_or(SandboxError::Terminated)?;
        inbox
            .send(message)
            .map_err(|_| SandboxError::ChannelClosed)
    }

    fn interrupt(&mut self) {
        self.interrupt.raise();
    }

    fn terminate(&mut self) {
        self.interrupt.raise();
        self.kill.cancel();
        self.inbox = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FallbackExecutor {
    fn drop(&mut self) {
        self.terminate();
    }
}
