//! Shared fixtures for the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use scriptbox_core::{
    InputResolver, Interpreter, InterpreterLauncher, Launcher, OutputStream, PlotImage,
    RunReport, RunUi, RunnerConfig, ScriptedInterpreter, Session, SessionHandle,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// UI that records everything and answers prompts from a script
#[derive(Default)]
pub struct RecordingUi {
    answers: Mutex<VecDeque<String>>,
    delay: Duration,
    output: Mutex<Vec<(OutputStream, String)>>,
    prompts: Mutex<Vec<String>>,
    /// Resolvers with no scripted answer are parked here
    unanswered: Mutex<Vec<InputResolver>>,
    /// Drop unanswered resolvers instead, like a closed stdin
    closes_input: bool,
    images: Mutex<Vec<PlotImage>>,
    dismissed: Mutex<usize>,
    finished: Mutex<Vec<RunReport>>,
}

impl RecordingUi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer prompts in order, each after `delay`
    pub fn answering(answers: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            delay,
            ..Default::default()
        })
    }

    /// Never answer; every prompt's resolver is dropped at once
    pub fn closing_input() -> Arc<Self> {
        Arc::new(Self {
            closes_input: true,
            ..Default::default()
        })
    }

    pub fn text(&self, stream: OutputStream) -> String {
        self.output
            .lock()
            .iter()
            .filter(|(s, _)| *s == stream)
            .map(|(_, text)| text.as_str())
            .collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn images(&self) -> Vec<PlotImage> {
        self.images.lock().clone()
    }

    pub fn dismissed(&self) -> usize {
        *self.dismissed.lock()
    }

    pub fn finished(&self) -> Vec<RunReport> {
        self.finished.lock().clone()
    }
}

impl RunUi for RecordingUi {
    fn append_output(&self, stream: OutputStream, text: &str) {
        self.output.lock().push((stream, text.to_string()));
    }

    fn present_input(&self, prompt: &str, resolver: InputResolver) {
        self.prompts.lock().push(prompt.to_string());
        let Some(answer) = self.answers.lock().pop_front() else {
            if !self.closes_input {
                self.unanswered.lock().push(resolver);
            }
            return;
        };
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            resolver.resolve(answer);
        });
    }

    fn dismiss_input(&self) {
        *self.dismissed.lock() += 1;
    }

    fn display_image(&self, image: &PlotImage) {
        self.images.lock().push(image.clone());
    }

    fn run_finished(&self, report: &RunReport) {
        self.finished.lock().push(report.clone());
    }
}

/// Launcher building scripted interpreters with `make`
pub fn launcher(make: fn() -> ScriptedInterpreter) -> Arc<dyn Launcher> {
    Arc::new(InterpreterLauncher::new(move || -> Box<dyn Interpreter> {
        Box::new(make())
    }))
}

/// Short limits so timing tests stay fast
pub fn quick_config() -> RunnerConfig {
    RunnerConfig {
        exec_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_millis(300),
        init_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn session(
    config: RunnerConfig,
    make: fn() -> ScriptedInterpreter,
    ui: Arc<RecordingUi>,
) -> (SessionHandle, JoinHandle<()>) {
    Session::spawn(config, launcher(make), ui)
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

/// Await a future with a generous upper bound
pub async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("finished within 10s")
}
