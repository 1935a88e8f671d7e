//! A deterministic interpreter for a small line-oriented Python subset
//!
//! Useful for exercising the runner without a Python installation. One
//! statement per line:
//!
//! | statement | effect |
//! |---|---|
//! | `print(a, b, file=sys.stderr, end="")` | write literals or variables |
//! | `x = <expr>` | bind a literal, a variable or an awaited input |
//! | `await __await_input__("prompt")` | ask the host for a line |
//! | `await __sleep__(0.5)` | cooperative sleep through the host |
//! | `time.sleep(0.5)` | blocking sleep, invisible to the host |
//! | `plt.<anything>(...)` / `plt.show()` / `plt.close()` | figure handling |
//! | `raise ValueError("message")` | fail with `ValueError: message` |
//! | `while True: pass` | busy loop that honours the interrupt flag |
//! | `native_spin()` | busy loop that ignores the interrupt flag |
//!
//! Blank lines, comments, `pass`, imports and the entry point header are
//! skipped. Plain `input(...)` fails with `EOFError` as it would in a
//! sandbox without a console.

use super::{ExecError, Host, Interpreter, OutputSink, Program};
use crate::interrupt::InterruptFlag;
use crate::protocol::PlotImage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug)]
pub struct ScriptedInterpreter {
    sink: OutputSink,
    interrupt: InterruptFlag,
    kill: CancellationToken,
    can_interrupt: bool,
    init_failure: Option<String>,
    graphics_loaded: bool,
    /// Figures drawn since the last show
    open_figures: Vec<PlotImage>,
    figure_seq: u64,
}

impl Default for ScriptedInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self {
            sink: OutputSink::discard(),
            interrupt: InterruptFlag::new(),
            kill: CancellationToken::new(),
            can_interrupt: true,
            init_failure: None,
            graphics_loaded: false,
            open_figures: Vec::new(),
            figure_seq: 0,
        }
    }

    /// Report no cooperative interrupt support
    pub fn without_interrupt(mut self) -> Self {
        self.can_interrupt = false;
        self
    }

    /// Fail initialization with the given message
    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.init_failure = Some(message.into());
        self
    }

    fn check_interrupt(&self) -> Result<(), ExecError> {
        if (self.can_interrupt && self.interrupt.is_raised()) || self.kill.is_cancelled() {
            return Err(ExecError::Interrupted);
        }
        Ok(())
    }

    async fn statement(
        &mut self,
        line: &str,
        vars: &mut HashMap<String, String>,
        host: &mut dyn Host,
    ) -> Result<(), ExecError> {
        if let Some(args) = call_args(line, "print") {
            return self.print(args, vars);
        }
        if line == "while True: pass" {
            return self.busy_loop().await;
        }
        if line == "native_spin()" {
            return self.native_spin();
        }
        if let Some(rest) = line.strip_prefix("raise ") {
            return Err(raise(rest, vars));
        }
        if let Some(args) = call_args(line, "await __sleep__") {
            return host.sleep(seconds(args)?).await;
        }
        if let Some(args) = call_args(line, "time.sleep") {
            std::thread::sleep(seconds(args)?);
            return Ok(());
        }
        if let Some(call) = line.strip_prefix("plt.") {
            return self.pyplot(call, host);
        }
        if let Some((name, expr)) = assignment(line) {
            let value = self.expression(expr, vars, host).await?;
            vars.insert(name.to_string(), value);
            return Ok(());
        }
        if line.starts_with("await ") || line.starts_with("input") {
            self.expression(line, vars, host).await?;
            return Ok(());
        }
        Err(ExecError::Runtime(format!(
            "SyntaxError: unsupported statement: {}",
            line
        )))
    }

    async fn expression(
        &mut self,
        expr: &str,
        vars: &HashMap<String, String>,
        host: &mut dyn Host,
    ) -> Result<String, ExecError> {
        let expr = expr.trim();
        if let Some(args) = call_args(expr, "await __await_input__") {
            let prompt = if args.trim().is_empty() {
                String::new()
            } else {
                value(args, vars)?
            };
            return host.input(&prompt).await;
        }
        if call_args(expr, "input").is_some() {
            return Err(ExecError::Runtime(
                "EOFError: EOF when reading a line".to_string(),
            ));
        }
        value(expr, vars)
    }

    fn print(&self, args: &str, vars: &HashMap<String, String>) -> Result<(), ExecError> {
        let mut to_stderr = false;
        let mut end = "\n".to_string();
        let mut parts = Vec::new();
        for arg in split_args(args) {
            if let Some(target) = arg.strip_prefix("file=") {
                to_stderr = target.trim() == "sys.stderr";
            } else if let Some(terminator) = arg.strip_prefix("end=") {
                end = value(terminator, vars)?;
            } else {
                parts.push(value(arg, vars)?);
            }
        }
        let text = format!("{}{}", parts.join(" "), end);
        if to_stderr {
            self.sink.stderr(&text);
        } else {
            self.sink.stdout(&text);
        }
        Ok(())
    }

    fn pyplot(&mut self, call: &str, host: &mut dyn Host) -> Result<(), ExecError> {
        if !self.graphics_loaded {
            return Err(ExecError::Runtime(
                "ModuleNotFoundError: No module named 'matplotlib'".to_string(),
            ));
        }
        if call_args(call, "show").is_some() {
            host.show(std::mem::take(&mut self.open_figures));
        } else if call_args(call, "close").is_some() {
            self.open_figures.clear();
        } else if self.open_figures.is_empty() {
            self.figure_seq += 1;
            self.open_figures.push(PlotImage::new(format!(
                "data:image/x-scripted-figure;figure={}",
                self.figure_seq
            )));
        }
        Ok(())
    }

    async fn busy_loop(&self) -> Result<(), ExecError> {
        loop {
            self.check_interrupt()?;
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stands in for native code that never returns to the interpreter
    fn native_spin(&self) -> Result<(), ExecError> {
        while !self.kill.is_cancelled() {
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(ExecError::Interrupted)
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn initialize(&mut self) -> Result<(), ExecError> {
        match &self.init_failure {
            Some(message) => Err(ExecError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }

    fn supports_interrupt(&self) -> bool {
        self.can_interrupt
    }

    fn install_output_sink(&mut self, sink: OutputSink) {
        self.sink = sink;
    }

    fn install_interrupt_flag(&mut self, flag: InterruptFlag) {
        self.interrupt = flag;
    }

    fn install_kill_switch(&mut self, kill: CancellationToken) {
        self.kill = kill;
    }

    async fn load_graphics(&mut self) -> Result<(), ExecError> {
        self.graphics_loaded = true;
        Ok(())
    }

    async fn execute(&mut self, program: &Program, host: &mut dyn Host) -> Result<(), ExecError> {
        let mut vars = HashMap::new();
        for raw in program.code.lines() {
            self.check_interrupt()?;
            let line = raw.trim();
            if is_skipped(line) {
                continue;
            }
            self.statement(line, &mut vars, host).await?;
        }
        Ok(())
    }

    fn take_figures(&mut self) -> Vec<PlotImage> {
        std::mem::take(&mut self.open_figures)
    }

    fn reset_graphics(&mut self) {
        self.open_figures.clear();
    }

    fn kill(&mut self) {
        self.open_figures.clear();
        self.kill.cancel();
    }
}

fn is_skipped(line: &str) -> bool {
    line.is_empty()
        || line == "pass"
        || line.starts_with('#')
        || line.starts_with("import ")
        || line.starts_with("from ")
        || line.starts_with("async def ")
}

/// Arguments of `name(...)` if `text` is exactly such a call
fn call_args<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(name)?.trim_start();
    rest.strip_prefix('(')?.strip_suffix(')')
}

/// `name = expr` where `name` is a plain identifier
fn assignment(line: &str) -> Option<(&str, &str)> {
    let (name, expr) = line.split_once('=')?;
    let name = name.trim();
    let is_identifier = !name.is_empty()
        && name.chars().all(|c| c == '_' || c.is_alphanumeric())
        && !name.starts_with(|c: char| c.is_ascii_digit());
    (is_identifier && !expr.starts_with('=')).then_some((name, expr))
}

fn split_args(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in args.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = args[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

fn value(expr: &str, vars: &HashMap<String, String>) -> Result<String, ExecError> {
    let expr = expr.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = expr
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Ok(inner.replace("\\n", "\n"));
        }
    }
    if expr.parse::<f64>().is_ok() {
        return Ok(expr.to_string());
    }
    vars.get(expr)
        .cloned()
        .ok_or_else(|| ExecError::Runtime(format!("NameError: name '{}' is not defined", expr)))
}

fn seconds(args: &str) -> Result<Duration, ExecError> {
    let secs: f64 = args
        .trim()
        .parse()
        .map_err(|_| ExecError::Runtime(format!("TypeError: invalid delay '{}'", args.trim())))?;
    Ok(Duration::from_secs_f64(secs.max(0.0)))
}

fn raise(rest: &str, vars: &HashMap<String, String>) -> ExecError {
    let rest = rest.trim();
    match rest.split_once('(') {
        Some((name, args)) => {
            let message = args
                .strip_suffix(')')
                .map(|inner| value(inner, vars).unwrap_or_else(|_| inner.to_string()))
                .unwrap_or_default();
            if message.is_empty() {
                ExecError::Runtime(name.trim().to_string())
            } else {
                ExecError::Runtime(format!("{}: {}", name.trim(), message))
            }
        }
        None => ExecError::Runtime(rest.to_string()),
    }
}
