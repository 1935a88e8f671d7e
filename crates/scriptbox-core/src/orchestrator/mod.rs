//! Run orchestration
//!
//! [`Orchestrator`] is a synchronous state machine. Each public method
//! handles one stimulus (a UI command, a sandbox message, an input reply or
//! an elapsed deadline) and returns; nothing in here awaits. [`Session`]
//! owns one orchestrator on a tokio task and feeds it from a `select!` loop.
//!
//! Invariants:
//! - at most one run is live, and at most one sandbox is alive;
//! - messages from a retired sandbox instance or an older run token are
//!   dropped;
//! - every run ends through [`Orchestrator::finalize`] exactly once.

mod report;
mod session;

pub use report::{RunOutcome, RunReport};
pub use session::{Session, SessionHandle};

use crate::codec::{Control, MarkerDecoder, Segment, SleepPhase, normalize_output};
use crate::config::{ExecutorPreference, RunnerConfig};
use crate::error::{RunnerError, RunnerResult};
use crate::input::{InputReply, InputSlot};
use crate::instrument::instrument;
use crate::interrupt::StopReason;
use crate::protocol::{
    Envelope, HostMessage, OutputEvent, PlotImage, RunRequest, RunToken, SandboxInstance,
    SandboxSignal,
};
use crate::sandbox::{ExecutorKind, Launcher, SandboxHandle, SandboxState};
use crate::timer::{ExecTimer, Resumed};
use crate::ui::{OutputStream, RunUi};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Messages shown to the user by the runner itself
pub mod notices {
    use std::time::Duration;

    pub const INTERRUPTED: &str = "Execution interrupted (KeyboardInterrupt).";
    pub const RESTARTED: &str = "Execution interrupted (sandbox restarted).";
    pub const NOTHING_TO_RUN: &str = "There is no code to run.";

    pub fn time_limit(limit: Duration) -> String {
        format!(
            "Execution stopped: time limit exceeded ({} s).",
            limit.as_secs_f64()
        )
    }
}

const REPORT_CAPACITY: usize = 16;

/// Where the current run is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Waiting for a sandbox to become ready
    Starting,
    Running,
    /// Stop requested, waiting for the sandbox to confirm
    Cancelling,
    /// Inside finalize
    Completing,
}

/// Which deadline the session should wake up for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Sandbox initialization took too long
    Init,
    /// Execution budget ran out
    Timer,
    /// Cooperative stop was not honoured in time
    Grace,
}

struct ActiveRun {
    token: RunToken,
    /// Request waiting for a ready sandbox
    pending: Option<RunRequest>,
    executor: Option<ExecutorKind>,
    timer: Option<ExecTimer>,
    stdout: MarkerDecoder,
    stderr: MarkerDecoder,
    transcript: String,
    stop: Option<StopReason>,
    /// The sandbox had to be torn down to end the run
    restarted: bool,
}

impl ActiveRun {
    fn new(request: RunRequest) -> Self {
        Self {
            token: request.token,
            pending: Some(request),
            executor: None,
            timer: None,
            stdout: MarkerDecoder::new(),
            stderr: MarkerDecoder::new(),
            transcript: String::new(),
            stop: None,
            restarted: false,
        }
    }
}

/// Owns the sandbox and the run lifecycle for one session
pub struct Orchestrator {
    config: RunnerConfig,
    launcher: Arc<dyn Launcher>,
    ui: Arc<dyn RunUi>,
    events: mpsc::UnboundedSender<Envelope>,
    reports: broadcast::Sender<RunReport>,
    sandbox: Option<SandboxHandle>,
    instances: u64,
    last_token: RunToken,
    phase: Phase,
    run: Option<ActiveRun>,
    input: InputSlot,
    init_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
    fallback_tried: bool,
}

impl Orchestrator {
    /// Create an orchestrator and the receiving end of its event channel
    ///
    /// Every sandbox it launches posts into the same channel; the caller
    /// feeds what arrives back through [`on_event`](Self::on_event).
    pub fn new(
        config: RunnerConfig,
        launcher: Arc<dyn Launcher>,
        ui: Arc<dyn RunUi>,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let orchestrator = Self {
            config,
            launcher,
            ui,
            events,
            reports,
            sandbox: None,
            instances: 0,
            last_token: RunToken::NONE,
            phase: Phase::Idle,
            run: None,
            input: InputSlot::new(),
            init_deadline: None,
            grace_deadline: None,
            fallback_tried: false,
        };
        (orchestrator, rx)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Token of the live run, if any
    pub fn current_token(&self) -> Option<RunToken> {
        self.run.as_ref().map(|run| run.token)
    }

    pub fn sandbox_state(&self) -> Option<SandboxState> {
        self.sandbox.as_ref().map(SandboxHandle::state)
    }

    pub fn sandbox_instance(&self) -> Option<SandboxInstance> {
        self.sandbox.as_ref().map(SandboxHandle::instance)
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.input.is_pending()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunReport> {
        self.reports.subscribe()
    }

    pub(crate) fn report_sender(&self) -> broadcast::Sender<RunReport> {
        self.reports.clone()
    }

    /// Start running `source`, replacing any live run
    pub fn start(&mut self, source: &str) -> RunnerResult<RunToken> {
        if let Some(run) = self.run.as_ref() {
            // A stop already in flight keeps its reason
            let reason = run.stop.unwrap_or(StopReason::Superseded);
            self.hard_stop(reason);
        }

        if source.trim().is_empty() {
            self.ui
                .append_output(OutputStream::Notice, &normalize_output(notices::NOTHING_TO_RUN));
            return Err(RunnerError::EmptySource);
        }

        let token = self.last_token.next();
        self.last_token = token;

        let instrumented = instrument(source, &self.config.instrument_options());
        info!(
            %token,
            instrumented = instrumented.instrumented,
            needs_graphics = instrumented.needs_graphics,
            rewrites = instrumented.rewrites,
            "run started"
        );

        self.run = Some(ActiveRun::new(RunRequest {
            token,
            code: instrumented.code,
            instrumented: instrumented.instrumented,
            needs_graphics: instrumented.needs_graphics,
        }));
        self.phase = Phase::Starting;

        if self.sandbox.as_ref().is_some_and(SandboxHandle::is_ready) {
            self.dispatch_pending();
        } else {
            self.retire_sandbox();
            self.fallback_tried = false;
            let kind = match self.config.executor {
                ExecutorPreference::Fallback => ExecutorKind::Fallback,
                ExecutorPreference::Auto | ExecutorPreference::Worker => ExecutorKind::Worker,
            };
            self.launch(kind);
        }
        Ok(token)
    }

    /// Handle one message from a sandbox
    pub fn on_event(&mut self, envelope: Envelope) {
        let Envelope { instance, message } = envelope;
        if self.sandbox_instance() != Some(instance) {
            debug!(%instance, ?message, "dropping message from retired sandbox");
            return;
        }

        match SandboxSignal::from(message) {
            SandboxSignal::Ready { can_interrupt } => self.on_ready(can_interrupt),
            SandboxSignal::Log(message) => debug!(%instance, %message, "sandbox log"),
            SandboxSignal::Run { token, event } if token.is_none() => {
                match (self.phase, event) {
                    (Phase::Starting, OutputEvent::Error(message)) => {
                        let kind = self.sandbox.as_ref().map(SandboxHandle::kind);
                        self.launch_failed(kind.unwrap_or(ExecutorKind::Worker), message);
                    }
                    (_, event) => debug!(%instance, ?event, "dropping message outside a run"),
                }
            }
            SandboxSignal::Run { token, event } => {
                if self.current_token() != Some(token) {
                    debug!(%token, ?event, "dropping stale run message");
                    return;
                }
                self.on_run_event(event);
            }
        }
    }

    fn on_ready(&mut self, can_interrupt: bool) {
        let Some(sandbox) = self.sandbox.as_mut() else {
            return;
        };
        sandbox.mark_ready(can_interrupt);
        self.init_deadline = None;
        info!(
            instance = %sandbox.instance(),
            kind = %sandbox.kind(),
            can_interrupt,
            "sandbox ready"
        );
        if self.phase == Phase::Starting {
            self.dispatch_pending();
        }
    }

    fn on_run_event(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::Text(data) => self.decode(OutputStream::Stdout, &data),
            OutputEvent::ErrorText(data) => self.decode(OutputStream::Stderr, &data),
            OutputEvent::InputRequest(prompt) => self.request_input(prompt),
            OutputEvent::PlotReady(image) => self.show_plot(image),
            OutputEvent::SleepBegin => self.pause_timer(),
            OutputEvent::SleepEnd => self.resume_timer(),
            OutputEvent::Done => self.finalize(RunOutcome::Completed),
            OutputEvent::Stopped => {
                let reason = self
                    .run
                    .as_ref()
                    .and_then(|run| run.stop)
                    .unwrap_or(StopReason::User);
                self.finalize(RunOutcome::Stopped(reason));
            }
            OutputEvent::Error(message) => self.finalize(RunOutcome::Failed(message)),
        }
    }

    /// Handle the UI's answer to the outstanding input request
    pub fn on_input_reply(&mut self, token: RunToken, reply: InputReply) {
        if self.current_token() != Some(token) || self.phase != Phase::Running {
            debug!(%token, "input reply for a run that is no longer active");
            return;
        }
        match reply {
            InputReply::Value(value) => {
                if let Some(run) = self.run.as_mut() {
                    run.transcript.push_str(&value);
                    run.transcript.push('\n');
                }
                let posted = match self.sandbox.as_mut() {
                    Some(sandbox) => sandbox.post(HostMessage::InputResponse { value }),
                    None => Ok(()),
                };
                if let Err(e) = posted {
                    warn!(%token, error = %e, "could not deliver input response");
                }
            }
            InputReply::Cancelled => {
                debug!(%token, "input affordance closed without a value; ending input");
                let posted = match self.sandbox.as_mut() {
                    Some(sandbox) => sandbox.post(HostMessage::InputClosed),
                    None => Ok(()),
                };
                if let Err(e) = posted {
                    warn!(%token, error = %e, "could not deliver end of input");
                }
            }
        }
        self.resume_timer();
    }

    /// Stop the live run
    ///
    /// Cooperative when the sandbox supports it: the interrupt flag is
    /// raised and the sandbox gets the grace period to confirm. Otherwise the
    /// sandbox is torn down right away.
    pub fn cancel(&mut self, reason: StopReason) {
        let now = Instant::now();
        let Some(run) = self.run.as_mut() else {
            debug!(%reason, "nothing to cancel");
            return;
        };
        let token = run.token;

        match self.phase {
            Phase::Cancelling | Phase::Completing | Phase::Idle => {
                debug!(%token, %reason, phase = ?self.phase, "cancel ignored");
                return;
            }
            Phase::Starting => {
                run.stop = Some(reason);
                info!(%token, %reason, "run cancelled before it was dispatched");
                self.retire_sandbox();
                self.finalize(RunOutcome::Stopped(reason));
                return;
            }
            Phase::Running => {}
        }

        run.stop = Some(reason);
        if let Some(timer) = run.timer.as_mut() {
            timer.pause(now);
        }
        if self.input.cancel() {
            self.ui.dismiss_input();
        }

        let can_interrupt = self
            .sandbox
            .as_ref()
            .is_some_and(SandboxHandle::can_interrupt);
        match self.sandbox.as_mut() {
            Some(sandbox) if can_interrupt => {
                info!(%token, %reason, "requesting cooperative stop");
                sandbox.interrupt();
                if let Err(e) = sandbox.post(HostMessage::Stop) {
                    debug!(%token, error = %e, "stop message not delivered");
                }
                self.phase = Phase::Cancelling;
                self.grace_deadline = Some(now + self.config.stop_grace);
            }
            _ => {
                info!(%token, %reason, "sandbox cannot be interrupted; restarting it");
                self.hard_stop(reason);
            }
        }
    }

    /// The next deadline the session has to wake up for
    pub fn next_deadline(&self) -> Option<(Instant, Deadline)> {
        match self.phase {
            Phase::Starting => self.init_deadline.map(|at| (at, Deadline::Init)),
            Phase::Running => {
                let timer = self.run.as_ref()?.timer.as_ref()?;
                timer.deadline().map(|at| (at, Deadline::Timer))
            }
            Phase::Cancelling => self.grace_deadline.map(|at| (at, Deadline::Grace)),
            Phase::Idle | Phase::Completing => None,
        }
    }

    /// Handle an elapsed deadline; stale wake-ups are ignored
    pub fn on_deadline(&mut self, deadline: Deadline) {
        let now = Instant::now();
        match deadline {
            Deadline::Init => {
                if self.phase != Phase::Starting || self.init_deadline.is_none_or(|at| at > now) {
                    return;
                }
                let Some(kind) = self.sandbox.as_ref().map(SandboxHandle::kind) else {
                    return;
                };
                warn!(
                    %kind,
                    timeout = ?self.config.init_timeout,
                    "sandbox did not become ready in time"
                );
                self.launch_failed(kind, "initialization timed out".to_string());
            }
            Deadline::Timer => {
                let due = self
                    .run
                    .as_ref()
                    .and_then(|run| run.timer.as_ref())
                    .and_then(ExecTimer::deadline)
                    .is_some_and(|at| at <= now);
                if self.phase == Phase::Running && due {
                    self.expire_timer(now);
                }
            }
            Deadline::Grace => {
                if self.phase != Phase::Cancelling || self.grace_deadline.is_none_or(|at| at > now)
                {
                    return;
                }
                let reason = self
                    .run
                    .as_ref()
                    .and_then(|run| run.stop)
                    .unwrap_or(StopReason::User);
                warn!(
                    token = ?self.current_token(),
                    grace = ?self.config.stop_grace,
                    "sandbox ignored the stop request; terminating it"
                );
                self.hard_stop(reason);
            }
        }
    }

    /// Wait for the UI to answer the outstanding input request
    ///
    /// Pends forever while none is outstanding; cancel-safe.
    pub async fn next_input_reply(&mut self) -> (RunToken, InputReply) {
        self.input.next_reply().await
    }

    /// Stop the live run and tear the sandbox down
    pub fn shutdown(&mut self) {
        if self.run.is_some() {
            self.retire_sandbox();
            self.finalize(RunOutcome::Stopped(StopReason::Shutdown));
        }
        self.retire_sandbox();
        debug!("orchestrator shut down");
    }

    fn launch(&mut self, kind: ExecutorKind) {
        self.instances += 1;
        let instance = SandboxInstance::new(self.instances);
        let launched = self
            .launcher
            .launch(kind, instance, self.events.clone())
            .map(SandboxHandle::new)
            .and_then(|mut handle| handle.begin_init().map(|()| handle));

        match launched {
            Ok(handle) => {
                debug!(%instance, %kind, "sandbox initializing");
                self.sandbox = Some(handle);
                self.init_deadline = Some(Instant::now() + self.config.init_timeout);
            }
            Err(e) => self.launch_failed(kind, e.to_string()),
        }
    }

    /// A sandbox could not be started; fall back once, then give up
    fn launch_failed(&mut self, kind: ExecutorKind, reason: String) {
        self.retire_sandbox();
        self.init_deadline = None;

        let may_fall_back = kind == ExecutorKind::Worker
            && self.config.executor == ExecutorPreference::Auto
            && !self.fallback_tried;
        if may_fall_back {
            warn!(%reason, "worker sandbox unavailable; switching to the fallback executor");
            self.fallback_tried = true;
            self.launch(ExecutorKind::Fallback);
        } else {
            error!(%kind, %reason, "sandbox could not be started");
            self.finalize(RunOutcome::Failed(format!(
                "Sandbox could not be started: {}",
                reason
            )));
        }
    }

    fn dispatch_pending(&mut self) {
        let (Some(run), Some(sandbox)) = (self.run.as_mut(), self.sandbox.as_mut()) else {
            return;
        };
        let Some(request) = run.pending.take() else {
            return;
        };
        let token = request.token;
        let kind = sandbox.kind();

        match sandbox.dispatch(request) {
            Ok(()) => {
                run.executor = Some(kind);
                run.timer = Some(ExecTimer::start(self.config.time_limit(), Instant::now()));
                self.phase = Phase::Running;
                debug!(%token, %kind, instance = %sandbox.instance(), "run dispatched");
            }
            Err(e) => {
                error!(%token, error = %e, "could not dispatch run");
                self.retire_sandbox();
                self.finalize(RunOutcome::Failed(e.to_string()));
            }
        }
    }

    fn decode(&mut self, stream: OutputStream, data: &str) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let segments = match stream {
            OutputStream::Stderr => run.stderr.push(data),
            _ => run.stdout.push(data),
        };
        self.apply_segments(stream, segments);
    }

    fn flush_decoders(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let stdout = run.stdout.finish();
        let stderr = run.stderr.finish();
        self.apply_segments(OutputStream::Stdout, stdout);
        self.apply_segments(OutputStream::Stderr, stderr);
    }

    fn apply_segments(&mut self, stream: OutputStream, segments: Vec<Segment>) {
        for segment in segments {
            match segment {
                Segment::Text(text) => self.write_output(stream, &text),
                Segment::Control(Control::Input(prompt)) => self.request_input(prompt),
                Segment::Control(Control::Plot(data)) => self.show_plot(PlotImage::new(data)),
                Segment::Control(Control::Sleep(SleepPhase::Begin)) => self.pause_timer(),
                Segment::Control(Control::Sleep(SleepPhase::End)) => self.resume_timer(),
            }
        }
    }

    fn write_output(&mut self, stream: OutputStream, text: &str) {
        let text = normalize_output(text);
        if text.is_empty() {
            return;
        }
        if let Some(run) = self.run.as_mut() {
            run.transcript.push_str(&text);
        }
        self.ui.append_output(stream, &text);
    }

    fn show_plot(&mut self, image: PlotImage) {
        if let Some(token) = self.current_token() {
            debug!(%token, bytes = image.data().len(), "plot received");
        }
        self.ui.display_image(&image);
    }

    fn request_input(&mut self, prompt: String) {
        let Some(token) = self.current_token() else {
            return;
        };
        if self.phase != Phase::Running {
            debug!(%token, phase = ?self.phase, "input request outside a running run");
            return;
        }
        let Some(resolver) = self.input.open(token, &prompt) else {
            debug!(%token, %prompt, "input already pending; ignoring second request");
            return;
        };

        // Output held back by the decoders belongs before the prompt
        self.flush_decoders();
        self.pause_timer();
        if let Some(run) = self.run.as_mut() {
            run.transcript.push_str(&prompt);
        }
        debug!(%token, "waiting for input");
        self.ui.present_input(&prompt, resolver);
    }

    fn pause_timer(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        if let Some(timer) = self.run.as_mut().and_then(|run| run.timer.as_mut()) {
            timer.pause(Instant::now());
        }
    }

    fn resume_timer(&mut self) {
        if self.phase != Phase::Running || self.input.is_pending() {
            return;
        }
        let now = Instant::now();
        let Some(timer) = self.run.as_mut().and_then(|run| run.timer.as_mut()) else {
            return;
        };
        if timer.resume(now) == Resumed::Expired {
            self.expire_timer(now);
        }
    }

    fn expire_timer(&mut self, now: Instant) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let Some(timer) = run.timer.as_mut() else {
            return;
        };
        if timer.expire(now) {
            info!(token = %run.token, budget = ?timer.budget(), "execution time limit reached");
            self.cancel(StopReason::Timeout);
        }
    }

    /// Tear the sandbox down and end the run locally
    fn hard_stop(&mut self, reason: StopReason) {
        if let Some(run) = self.run.as_mut() {
            run.restarted = true;
        }
        self.retire_sandbox();
        self.finalize(RunOutcome::Stopped(reason));
    }

    fn retire_sandbox(&mut self) {
        if let Some(mut sandbox) = self.sandbox.take() {
            sandbox.terminate();
        }
    }

    /// The single exit path of every run
    fn finalize(&mut self, outcome: RunOutcome) {
        if self.run.is_none() {
            return;
        }
        self.phase = Phase::Completing;
        if self.input.cancel() {
            self.ui.dismiss_input();
        }
        self.flush_decoders();

        let restarted = self.run.as_ref().is_some_and(|run| run.restarted);
        match &outcome {
            RunOutcome::Completed => {}
            RunOutcome::Stopped(StopReason::Timeout) => {
                let notice = notices::time_limit(self.config.exec_timeout);
                self.write_output(OutputStream::Notice, &notice);
            }
            RunOutcome::Stopped(StopReason::User) if restarted => {
                self.write_output(OutputStream::Notice, notices::RESTARTED);
            }
            RunOutcome::Stopped(StopReason::User) => {
                self.write_output(OutputStream::Notice, notices::INTERRUPTED);
            }
            RunOutcome::Stopped(StopReason::Superseded | StopReason::Shutdown) => {}
            RunOutcome::Failed(message) => self.write_output(OutputStream::Stderr, message),
        }

        let Some(mut run) = self.run.take() else {
            return;
        };
        let running_time = run
            .timer
            .as_mut()
            .map(|timer| timer.release(Instant::now()))
            .unwrap_or_default();
        if let Some(sandbox) = self.sandbox.as_mut() {
            sandbox.mark_idle();
        }
        self.init_deadline = None;
        self.grace_deadline = None;
        self.phase = Phase::Idle;

        info!(
            token = %run.token,
            %outcome,
            running_time = ?running_time,
            "run finished"
        );
        let report = RunReport {
            token: run.token,
            outcome,
            executor: run.executor,
            running_time,
            transcript: run.transcript,
        };
        self.ui.run_finished(&report);
        if self.reports.send(report).is_err() {
            debug!("no report subscribers");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.retire_sandbox();
    }
}
