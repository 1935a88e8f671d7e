//! Sandbox-side harness shared by the worker and fallback executors

use super::SandboxError;
use crate::codec::{self, Control, SleepPhase};
use crate::interpreter::{ExecError, Host, Interpreter, OutputSink, Program, Stream};
use crate::interrupt::InterruptFlag;
use crate::protocol::{
    Envelope, HostMessage, PlotImage, RunRequest, RunToken, SandboxInstance, SandboxMessage,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How control requests reach the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlChannel {
    /// Typed messages
    Structured,
    /// Marker lines inside stdout
    Text,
}

/// Posts sandbox messages tagged with this instance and the current run
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    instance: SandboxInstance,
    events: mpsc::UnboundedSender<Envelope>,
    token: Arc<AtomicU64>,
    channel: ControlChannel,
}

impl Emitter {
    pub(crate) fn new(
        instance: SandboxInstance,
        events: mpsc::UnboundedSender<Envelope>,
        channel: ControlChannel,
    ) -> Self {
        Self {
            instance,
            events,
            token: Arc::new(AtomicU64::new(RunToken::NONE.get())),
            channel,
        }
    }

    fn token(&self) -> RunToken {
        RunToken::new(self.token.load(Ordering::SeqCst))
    }

    fn set_token(&self, token: RunToken) {
        self.token.store(token.get(), Ordering::SeqCst);
    }

    pub(crate) fn post(&self, message: SandboxMessage) {
        let envelope = Envelope {
            instance: self.instance,
            message,
        };
        if self.events.send(envelope).is_err() {
            debug!(instance = %self.instance, "host no longer listening");
        }
    }

    fn output(&self, stream: Stream, data: &str) {
        let token = self.token();
        let data = data.to_string();
        self.post(match stream {
            Stream::Stdout => SandboxMessage::Stdout { token, data },
            Stream::Stderr => SandboxMessage::Stderr { token, data },
        });
    }

    fn control(&self, control: Control) {
        let token = self.token();
        let message = match (self.channel, control) {
            (ControlChannel::Text, control) => SandboxMessage::Stdout {
                token,
                data: codec::encode(&control),
            },
            (ControlChannel::Structured, Control::Input(prompt)) => {
                SandboxMessage::InputRequest { token, prompt }
            }
            (ControlChannel::Structured, Control::Plot(data)) => SandboxMessage::Plot {
                token,
                data: PlotImage::new(data),
            },
            (ControlChannel::Structured, Control::Sleep(SleepPhase::Begin)) => {
                SandboxMessage::SleepBegin { token }
            }
            (ControlChannel::Structured, Control::Sleep(SleepPhase::End)) => {
                SandboxMessage::SleepEnd { token }
            }
        };
        self.post(message);
    }

    fn sink(&self) -> OutputSink {
        let emitter = self.clone();
        OutputSink::new(move |stream, text| emitter.output(stream, text))
    }
}

/// Owns the interpreter and serves host messages
pub(crate) struct Harness {
    interpreter: Box<dyn Interpreter>,
    emitter: Emitter,
    interrupt: InterruptFlag,
    kill: CancellationToken,
    initialized: bool,
}

impl Harness {
    pub(crate) fn new(
        mut interpreter: Box<dyn Interpreter>,
        emitter: Emitter,
        interrupt: InterruptFlag,
        kill: CancellationToken,
    ) -> Self {
        interpreter.install_output_sink(emitter.sink());
        interpreter.install_interrupt_flag(interrupt.clone());
        interpreter.install_kill_switch(kill.clone());
        Self {
            interpreter,
            emitter,
            interrupt,
            kill,
            initialized: false,
        }
    }

    /// Serve until the inbox closes or the kill switch fires
    pub(crate) async fn serve(mut self, inbox: mpsc::UnboundedReceiver<HostMessage>) {
        let (input_tx, mut inputs) = mpsc::unbounded_channel();
        let (job_tx, mut jobs) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let router = tokio::spawn(route(
            inbox,
            job_tx,
            input_tx,
            self.interrupt.clone(),
            self.emitter.clone(),
            busy.clone(),
        ));
        let kill = self.kill.clone();

        loop {
            let job = tokio::select! {
                biased;
                _ = kill.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            match job {
                HostMessage::Init => self.init().await,
                HostMessage::Run(request) => {
                    tokio::select! {
                        biased;
                        _ = kill.cancelled() => break,
                        _ = self.run(request, &mut inputs) => {}
                    }
                    busy.store(false, Ordering::SeqCst);
                }
                other => debug!(?other, "unexpected job"),
            }
        }

        self.interpreter.kill();
        router.abort();
        debug!(instance = %self.emitter.instance, "sandbox harness stopped");
    }

    async fn init(&mut self) {
        if !self.initialized {
            if let Err(e) = self.interpreter.initialize().await {
                error!(
                    instance = %self.emitter.instance,
                    interpreter = self.interpreter.name(),
                    error = %e,
                    "interpreter failed to initialize"
                );
                self.emitter.post(SandboxMessage::Error {
                    token: RunToken::NONE,
                    message: e.to_string(),
                });
                return;
            }
            self.initialized = true;
        }
        self.emitter.post(SandboxMessage::Ready {
            can_interrupt: self.interpreter.supports_interrupt(),
        });
    }

    async fn run(
        &mut self,
        request: RunRequest,
        inputs: &mut mpsc::UnboundedReceiver<Option<String>>,
    ) {
        let token = request.token;
        if !self.initialized {
            self.emitter.post(SandboxMessage::Error {
                token,
                message: SandboxError::NotReady.to_string(),
            });
            return;
        }

        self.emitter.set_token(token);
        while inputs.try_recv().is_ok() {
            debug!(%token, "discarding input response left from an earlier run");
        }

        if request.needs_graphics {
            if let Err(e) = self.interpreter.load_graphics().await {
                warn!(%token, error = %e, "graphics support unavailable");
                self.emitter.post(SandboxMessage::Log {
                    message: format!("graphics unavailable: {}", e),
                });
            }
        }

        info!(%token, interpreter = self.interpreter.name(), "executing program");
        let program = Program::from(&request);
        let result = {
            let mut host = HarnessHost {
                emitter: &self.emitter,
                inputs,
                interrupt: &self.interrupt,
            };
            self.interpreter.execute(&program, &mut host).await
        };

        for figure in self.interpreter.take_figures() {
            self.emitter.control(Control::Plot(figure.data().to_string()));
        }
        self.interpreter.reset_graphics();

        let interrupted = self.interrupt.is_raised();
        self.interrupt.clear();

        let message = match result {
            Ok(()) => SandboxMessage::Done { token },
            Err(ExecError::Interrupted) => SandboxMessage::Stopped { token },
            Err(_) if interrupted => SandboxMessage::Stopped { token },
            Err(e) => SandboxMessage::Error {
                token,
                message: e.to_string(),
            },
        };
        self.emitter.post(message);
    }
}

/// Handles `stop` and input answers immediately, queues the rest
async fn route(
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
    jobs: mpsc::UnboundedSender<HostMessage>,
    inputs: mpsc::UnboundedSender<Option<String>>,
    interrupt: InterruptFlag,
    emitter: Emitter,
    busy: Arc<AtomicBool>,
) {
    while let Some(message) = inbox.recv().await {
        match message {
            HostMessage::Stop => interrupt.raise(),
            HostMessage::InputResponse { value } => {
                if inputs.send(Some(value)).is_err() {
                    debug!("input response with no waiter");
                }
            }
            HostMessage::InputClosed => {
                if inputs.send(None).is_err() {
                    debug!("input closed with no waiter");
                }
            }
            HostMessage::Run(request) => {
                if busy.swap(true, Ordering::SeqCst) {
                    emitter.post(SandboxMessage::Error {
                        token: request.token,
                        message: SandboxError::Busy.to_string(),
                    });
                } else if jobs.send(HostMessage::Run(request)).is_err() {
                    break;
                }
            }
            HostMessage::Init => {
                if jobs.send(HostMessage::Init).is_err() {
                    break;
                }
            }
        }
    }
}

/// Host services for one run
struct HarnessHost<'a> {
    emitter: &'a Emitter,
    /// `None` marks end of input
    inputs: &'a mut mpsc::UnboundedReceiver<Option<String>>,
    interrupt: &'a InterruptFlag,
}

#[async_trait]
impl<'a> Host for HarnessHost<'a> {
    async fn input(&mut self, prompt: &str) -> Result<String, ExecError> {
        self.emitter.control(Control::Input(prompt.to_string()));
        tokio::select! {
            biased;
            _ = self.interrupt.raised() => Err(ExecError::Interrupted),
            value = self.inputs.recv() => match value {
                Some(Some(value)) => Ok(value),
                Some(None) => Err(ExecError::EndOfInput),
                None => Err(ExecError::Io("input channel closed".to_string())),
            }
        }
    }

    async fn sleep(&mut self, duration: Duration) -> Result<(), ExecError> {
        self.sleep_begin();
        let result = tokio::select! {
            biased;
            _ = self.interrupt.raised() => Err(ExecError::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        };
        self.sleep_end();
        result
    }

    fn sleep_begin(&mut self) {
        self.emitter.control(Control::Sleep(SleepPhase::Begin));
    }

    fn sleep_end(&mut self) {
        self.emitter.control(Control::Sleep(SleepPhase::End));
    }

    fn emit_plot(&mut self, image: PlotImage) {
        self.emitter.control(Control::Plot(image.data().to_string()));
    }
}
