//! UI collaborator interface

use crate::input::InputResolver;
use crate::orchestrator::RunReport;
use crate::protocol::PlotImage;

/// Where a piece of output should be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    /// Program standard output
    Stdout,
    /// Program standard error
    Stderr,
    /// Messages from the runner itself (stopped, timed out, ...)
    Notice,
}

/// Front end driven by the orchestrator
///
/// Calls arrive from the session task and must not block.
#[cfg_attr(test, mockall::automock)]
pub trait RunUi: Send + Sync {
    /// Append text; it always ends with a newline
    fn append_output(&self, stream: OutputStream, text: &str);

    /// Show an input affordance and answer through `resolver`
    fn present_input(&self, prompt: &str, resolver: InputResolver);

    /// Withdraw the input affordance after cancellation
    fn dismiss_input(&self) {}

    fn display_image(&self, image: &PlotImage);

    /// Called once per finalized run
    fn run_finished(&self, _report: &RunReport) {}
}
