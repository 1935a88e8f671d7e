//! Terminal front end for a run

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use colored::*;
use parking_lot::Mutex;
use scriptbox_core::{InputResolver, OutputStream, PlotImage, RunReport, RunUi};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Shows output on the terminal and answers prompts from stdin
pub struct TerminalUi {
    plot_dir: Option<PathBuf>,
    plots: Mutex<usize>,
    requests: mpsc::UnboundedSender<InputResolver>,
    prompt_open: Mutex<bool>,
}

impl TerminalUi {
    /// Must be called inside a tokio runtime
    pub fn new(plot_dir: Option<PathBuf>) -> Self {
        let (requests, pending) = mpsc::unbounded_channel();
        let lines = spawn_stdin_reader();
        tokio::spawn(answer_prompts(pending, lines));
        Self {
            plot_dir,
            plots: Mutex::new(0),
            requests,
            prompt_open: Mutex::new(false),
        }
    }
}

impl RunUi for TerminalUi {
    fn append_output(&self, stream: OutputStream, text: &str) {
        *self.prompt_open.lock() = false;
        match stream {
            OutputStream::Stdout => {
                let mut stdout = io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            OutputStream::Stderr => eprint!("{}", text.red()),
            OutputStream::Notice => eprint!("{}", text.yellow().bold()),
        }
    }

    fn present_input(&self, prompt: &str, resolver: InputResolver) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(prompt.as_bytes());
        let _ = stdout.flush();
        *self.prompt_open.lock() = true;
        if self.requests.send(resolver).is_err() {
            debug!("input reader is gone");
        }
    }

    fn dismiss_input(&self) {
        let mut open = self.prompt_open.lock();
        if *open {
            println!();
            *open = false;
        }
    }

    fn display_image(&self, image: &PlotImage) {
        let index = {
            let mut plots = self.plots.lock();
            *plots += 1;
            *plots
        };
        let saved = match self.plot_dir.as_deref() {
            Some(dir) => write_plot(dir, index, image),
            None => Ok(None),
        };
        match saved {
            Ok(Some(path)) => println!("{} {}", "[plot]".cyan(), path.display()),
            Ok(None) => println!("{}", format!("[plot {}]", index).cyan()),
            Err(e) => {
                warn!(index, error = %e, "could not save plot");
                println!("{}", format!("[plot {}]", index).cyan());
            }
        }
    }

    fn run_finished(&self, report: &RunReport) {
        debug!(
            token = %report.token,
            outcome = %report.outcome,
            running_time = ?report.running_time,
            "run finished"
        );
    }
}

/// Decode a PNG plot into `dir`; `None` if the image is not a PNG
pub fn write_plot(dir: &Path, index: usize, image: &PlotImage) -> io::Result<Option<PathBuf>> {
    let Some(encoded) = image.png_base64() else {
        return Ok(None);
    };
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let path = dir.join(format!("plot-{}.png", index));
    std::fs::write(&path, bytes)?;
    Ok(Some(path))
}

/// Read stdin on a plain thread so a pending read never holds up exit
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = thread::Builder::new()
        .name("scriptbox-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "could not start the stdin reader; input will be unavailable");
    }
    rx
}

/// Pair each prompt with the next stdin line
///
/// A prompt withdrawn before its line arrives leaves that line for the
/// next prompt. When stdin closes the resolver is dropped, which the
/// running program sees as end of input.
async fn answer_prompts(
    mut pending: mpsc::UnboundedReceiver<InputResolver>,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(mut resolver) = pending.recv().await {
        tokio::select! {
            biased;
            _ = resolver.cancelled() => debug!("prompt withdrawn before a line arrived"),
            line = lines.recv() => match line {
                Some(line) => {
                    if !resolver.resolve(line) {
                        debug!("input arrived after the prompt was withdrawn");
                    }
                }
                None => {
                    debug!("stdin closed; ending input");
                    drop(resolver);
                }
            },
        }
    }
}
