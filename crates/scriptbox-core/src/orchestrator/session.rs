//! Session task driving one orchestrator

use super::{Orchestrator, RunReport};
use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::interrupt::StopReason;
use crate::protocol::{Envelope, RunToken};
use crate::sandbox::Launcher;
use crate::ui::RunUi;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

enum Command {
    Start {
        source: String,
        reply: oneshot::Sender<RunnerResult<RunToken>>,
    },
    Cancel,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running [`Session`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    reports: broadcast::Sender<RunReport>,
}

impl SessionHandle {
    /// Start a run, replacing the live one
    pub async fn start(&self, source: impl Into<String>) -> RunnerResult<RunToken> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                source: source.into(),
                reply,
            })
            .map_err(|_| RunnerError::SessionClosed)?;
        rx.await.map_err(|_| RunnerError::SessionClosed)?
    }

    /// Ask the live run to stop
    pub fn cancel(&self) -> RunnerResult<()> {
        self.commands
            .send(Command::Cancel)
            .map_err(|_| RunnerError::SessionClosed)
    }

    /// Stop the live run, tear the sandbox down and end the session task
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunReport> {
        self.reports.subscribe()
    }

    /// Start a run and wait for its report
    pub async fn run_to_completion(&self, source: impl Into<String>) -> RunnerResult<RunReport> {
        let mut reports = self.subscribe();
        let token = self.start(source).await?;
        loop {
            match reports.recv().await {
                Ok(report) if report.token == token => return Ok(report),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(%token, skipped, "report subscriber lagged");
                }
                Err(RecvError::Closed) => return Err(RunnerError::SessionClosed),
            }
        }
    }
}

/// Owns one [`Orchestrator`] and feeds it every stimulus in order
pub struct Session {
    orchestrator: Orchestrator,
    events: mpsc::UnboundedReceiver<Envelope>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Session {
    pub fn new(
        config: RunnerConfig,
        launcher: Arc<dyn Launcher>,
        ui: Arc<dyn RunUi>,
    ) -> (Self, SessionHandle) {
        let (orchestrator, events) = Orchestrator::new(config, launcher, ui);
        let (command_tx, commands) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: command_tx,
            reports: orchestrator.report_sender(),
        };
        let session = Self {
            orchestrator,
            events,
            commands,
        };
        (session, handle)
    }

    /// Run the session on the current tokio runtime
    pub fn spawn(
        config: RunnerConfig,
        launcher: Arc<dyn Launcher>,
        ui: Arc<dyn RunUi>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (session, handle) = Self::new(config, launcher, ui);
        (handle, tokio::spawn(session.run()))
    }

    /// Serve until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        loop {
            let deadline = self.orchestrator.next_deadline();
            let wake_at = deadline.map_or_else(Instant::now, |(at, _)| at);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start { source, reply }) => {
                        let _ = reply.send(self.orchestrator.start(&source));
                    }
                    Some(Command::Cancel) => self.orchestrator.cancel(StopReason::User),
                    Some(Command::Shutdown { done }) => {
                        self.orchestrator.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.orchestrator.shutdown();
                        break;
                    }
                },
                Some(envelope) = self.events.recv() => self.orchestrator.on_event(envelope),
                (token, reply) = self.orchestrator.next_input_reply() => {
                    self.orchestrator.on_input_reply(token, reply);
                }
                _ = time::sleep_until(wake_at), if deadline.is_some() => {
                    if let Some((_, kind)) = deadline {
                        self.orchestrator.on_deadline(kind);
                    }
                }
            }
        }
        debug!("session ended");
    }
}
