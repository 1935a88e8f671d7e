use super::harness::{ControlChannel, Emitter, Harness};
use super::{Executor, ExecutorKind, SandboxError, SandboxResult};
use crate::interpreter::Interpreter;
use crate::interrupt::InterruptFlag;
use crate::protocol::{Envelope, HostMessage, SandboxInstance, SandboxMessage};
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Sandbox on a dedicated OS thread with its own single-threaded runtime
///
/// The interrupt flag is shared directly with the thread, so raising it
/// does not depend on the sandbox draining its inbox. Termination cancels
/// the kill switch, closes the inbox and detaches the thread; a thread
/// stuck in native code exits once the interpreter notices the switch.
pub struct WorkerSandbox {
    instance: SandboxInstance,
    inbox: Option<mpsc::UnboundedSender<HostMessage>>,
    interrupt: InterruptFlag,
    kill: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerSandbox {
    pub fn spawn(
        instance: SandboxInstance,
        interpreter: Box<dyn Interpreter>,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> SandboxResult<Self> {
        let (inbox, rx) = mpsc::unbounded_channel();
        let interrupt = InterruptFlag::new();
        let kill = CancellationToken::new();
        let emitter = Emitter::new(instance, events, ControlChannel::Structured);
        let harness = Harness::new(interpreter, emitter.clone(), interrupt.clone(), kill.clone());

        let thread = thread::Builder::new()
            .name(format!("scriptbox-{}", instance))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(%instance, error = %e, "failed to build sandbox runtime");
                        emitter.post(SandboxMessage::Log {
                            message: format!("sandbox runtime unavailable: {}", e),
                        });
                        return;
                    }
                };
                runtime.block_on(harness.serve(rx));
            })
            .map_err(|e| SandboxError::LaunchFailed {
                kind: ExecutorKind::Worker,
                message: e.to_string(),
            })?;

        debug!(%instance, "worker sandbox spawned");
        Ok(Self {
            instance,
            inbox: Some(inbox),
            interrupt,
            kill,
            thread: Some(thread),
        })
    }
}

impl Executor for WorkerSandbox {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Worker
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
        if let Some(thread) = self.thread.take() {
            debug!(instance = %self.instance, finished = thread.is_finished(), "detaching worker thread");
        }
    }
}

impl Drop for WorkerSandbox {
    fn drop(&mut self) {
        self.terminate();
    }
}
