//! Ctrl+C handling for a running script

use colored::*;
use futures::stream::StreamExt;
use scriptbox_core::SessionHandle;
use signal_hook::consts::SIGINT;
use signal_hook_tokio::{Handle, Signals};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::debug;

/// Exit status used when the user interrupts twice
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Routes SIGINT to the session: the first press stops the run,
/// a second press exits immediately
pub struct SignalHandler {
    handle: Handle,
    task: JoinHandle<()>,
}

impl SignalHandler {
    /// Start listening for SIGINT
    pub fn start(session: SessionHandle) -> std::io::Result<Self> {
        let mut signals = Signals::new([SIGINT])?;
        let handle = signals.handle();
        let stopping = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                if signal != SIGINT {
                    continue;
                }
                if stopping.swap(true, Ordering::SeqCst) {
                    eprintln!("\n{}", "Interrupted again, exiting.".yellow());
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
                eprintln!(
                    "\n{}",
                    "Stopping the script... (press Ctrl+C again to exit)".yellow()
                );
                if session.cancel().is_err() {
                    debug!("session already closed");
                }
            }
        });

        Ok(Self { handle, task })
    }

    /// Stop listening
    pub async fn stop(self) {
        self.handle.close();
        if self.task.await.is_err() {
            debug!("signal task ended abnormally");
        }
    }
}
