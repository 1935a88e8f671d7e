//! Adapter for a system `python3`
//!
//! Each run spawns `python3 -u -c <bootstrap>`. The bootstrap reads the
//! program as one JSON line on stdin, defines the awaitable stubs, and
//! talks back through marker lines on stdout (see [`crate::codec`]).
//! Input values travel as further JSON lines on stdin.
//!
//! Cooperative interrupt is `SIGINT`, which Python turns into
//! `KeyboardInterrupt`; the bootstrap then exits with status 130. A
//! traceback is written to stderr after a private separator line so it
//! can become the run's error message rather than live output.

use super::{ExecError, Host, Interpreter, OutputSink, Program};
use crate::codec::{Control, MarkerDecoder, Segment, SleepPhase};
use crate::config::PythonConfig;
use crate::interrupt::InterruptFlag;
use crate::protocol::PlotImage;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit status the bootstrap uses for `KeyboardInterrupt`
const INTERRUPTED_STATUS: i32 = 130;

const TRACEBACK_SEPARATOR: &str = "\u{1e}scriptbox-traceback";

const BOOTSTRAP: &str = r#"
import asyncio, json, os, sys, traceback
_host_in = sys.stdin
sys.stdin = open(os.devnull)
_graphics = sys.argv[1] == "1"
_instrumented = sys.argv[2] == "1"
_separator = sys.argv[3]
_source = json.loads(_host_in.readline())

def _mark(kind, payload):
    sys.stdout.write(kind + str(payload).replace("\r", " ").replace("\n", " ") + "\n")
    sys.stdout.flush()

async def __await_input__(prompt=""):
    _mark("<<<INPUT>>>", "" if prompt is None else prompt)
    line = await asyncio.get_running_loop().run_in_executor(None, _host_in.readline)
    value = json.loads(line) if line else None
    if value is None:
        raise EOFError("EOF when reading a line")
    return str(value)

async def __sleep__(seconds):
    try:
        delay = max(0.0, float(seconds))
    except Exception:
        delay = 0.0
    _mark("<<<SLEEP>>>", "start")
    try:
        await asyncio.sleep(delay)
    finally:
        _mark("<<<SLEEP>>>", "end")

def __flush_plots__():
    pass

if _graphics:
    try:
        import base64, io
        import matplotlib
        matplotlib.use("Agg", force=True)
        from matplotlib import pyplot as _plt

        def __flush_plots__():
            for number in list(_plt.get_fignums()):
                figure = _plt.figure(number)
                try:
                    buffer = io.BytesIO()
                    figure.savefig(buffer, format="png", bbox_inches="tight")
                    _mark("<<<PLOT>>>", "data:image/png;base64," + base64.b64encode(buffer.getvalue()).decode("ascii"))
                finally:
                    _plt.close(figure)

        _plt.show = lambda *args, **kwargs: __flush_plots__()
    except Exception as error:
        sys.stderr.write("graphics unavailable: %s\n" % error)

_namespace = {
    "__name__": "__main__",
    "__builtins__": __builtins__,
    "__await_input__": __await_input__,
    "__sleep__": __sleep__,
    "__flush_plots__": __flush_plots__,
}

_status = 0
try:
    exec(compile(_source, "<main>", "exec"), _namespace)
    if _instrumented:
        asyncio.run(_namespace["__user_main__"]())
except KeyboardInterrupt:
    _status = 130
except SystemExit:
    raise
except BaseException:
    _status = 1
    sys.stdout.flush()
    sys.stderr.write(_separator + "\n" + traceback.format_exc())
    sys.stderr.flush()
finally:
    try:
        __flush_plots__()
    except BaseException as error:
        sys.stderr.write("could not flush plots: %s\n" % error)
    sys.stdout.flush()
os._exit(_status)
"#;

/// Runs programs with a system Python interpreter
#[derive(Debug)]
pub struct PythonInterpreter {
    config: PythonConfig,
    sink: OutputSink,
    interrupt: InterruptFlag,
    kill: CancellationToken,
    graphics: bool,
}

impl PythonInterpreter {
    pub fn new(config: PythonConfig) -> Self {
        Self {
            config,
            sink: OutputSink::discard(),
            interrupt: InterruptFlag::new(),
            kill: CancellationToken::new(),
            graphics: false,
        }
    }

    fn command(&self, program: &Program) -> Command {
        let flag = |on: bool| if on { "1" } else { "0" };
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg("-u")
            .arg("-c")
            .arg(BOOTSTRAP)
            .arg(flag(self.graphics || program.needs_graphics))
            .arg(flag(program.instrumented))
            .arg(TRACEBACK_SEPARATOR)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Interpreter for PythonInterpreter {
    fn name(&self) -> &str {
        "python"
    }

    async fn initialize(&mut self) -> Result<(), ExecError> {
        let output = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ExecError::Unavailable(format!("cannot start '{}': {}", self.config.program, e))
            })?;
        if !output.status.success() {
            return Err(ExecError::Unavailable(format!(
                "'{} --version' exited with {}",
                self.config.program, output.status
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        debug!(version = %version.trim(), "python interpreter ready");
        Ok(())
    }

    fn supports_interrupt(&self) -> bool {
        cfg!(unix)
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
        self.graphics = true;
        Ok(())
    }

    async fn execute(&mut self, program: &Program, host: &mut dyn Host) -> Result<(), ExecError> {
        let mut child = self.command(program).spawn().map_err(|e| {
            ExecError::Unavailable(format!("cannot start '{}': {}", self.config.program, e))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecError::Io("child stdin not captured".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Io("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Io("child stderr not captured".into()))?;

        send_line(&mut stdin, &program.code).await?;
        let traceback = tokio::spawn(forward_stderr(stderr, self.sink.clone()));

        let interrupt = self.interrupt.clone();
        let kill = self.kill.clone();
        let mut decoder = MarkerDecoder::new();
        let mut pending_bytes: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];
        let mut interrupt_sent = false;

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    pending_bytes.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut pending_bytes);
                    let segments = decoder.push(&text);
                    if let Err(e) = dispatch(segments, &self.sink, host, &mut stdin).await {
                        let _ = child.start_kill();
                        return Err(e);
                    }
                }
                _ = interrupt.raised(), if !interrupt_sent => {
                    interrupt_sent = true;
                    send_interrupt(&child);
                }
                _ = kill.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ExecError::Interrupted);
                }
            }
        }

        if !pending_bytes.is_empty() {
            let rest = String::from_utf8_lossy(&pending_bytes).into_owned();
            let segments = decoder.push(&rest);
            dispatch(segments, &self.sink, host, &mut stdin).await?;
        }
        let segments = decoder.finish();
        dispatch(segments, &self.sink, host, &mut stdin).await?;
        drop(stdin);

        let status = child.wait().await?;
        let traceback = traceback.await.unwrap_or_default();
        match status.code() {
            Some(0) => Ok(()),
            Some(INTERRUPTED_STATUS) => Err(ExecError::Interrupted),
            _ if self.interrupt.is_raised() => Err(ExecError::Interrupted),
            _ if !traceback.is_empty() => Err(ExecError::Runtime(traceback)),
            _ => Err(ExecError::Runtime(format!(
                "{} exited with {}",
                self.config.program, status
            ))),
        }
    }

    fn reset_graphics(&mut self) {
        self.graphics = false;
    }

    fn kill(&mut self) {
        self.kill.cancel();
    }
}

async fn send_line(stdin: &mut ChildStdin, value: &str) -> Result<(), ExecError> {
    let mut line = serde_json::to_string(value).map_err(|e| ExecError::Io(e.to_string()))?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

async fn dispatch(
    segments: Vec<Segment>,
    sink: &OutputSink,
    host: &mut dyn Host,
    stdin: &mut ChildStdin,
) -> Result<(), ExecError> {
    for segment in segments {
        match segment {
            Segment::Text(text) => sink.stdout(&text),
            Segment::Control(Control::Input(prompt)) => match host.input(&prompt).await {
                Ok(value) => send_line(stdin, &value).await?,
                // `null` makes the pending input() raise EOFError
                Err(ExecError::EndOfInput) => {
                    stdin.write_all(b"null\n").await?;
                    stdin.flush().await?;
                }
                Err(e) => return Err(e),
            },
            Segment::Control(Control::Plot(data)) => host.emit_plot(PlotImage::new(data)),
            Segment::Control(Control::Sleep(SleepPhase::Begin)) => host.sleep_begin(),
            Segment::Control(Control::Sleep(SleepPhase::End)) => host.sleep_end(),
        }
    }
    Ok(())
}

/// Decode the valid UTF-8 prefix, keeping an incomplete trailing sequence
fn take_utf8(bytes: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(bytes) {
        Ok(text) => text.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            bytes.clear();
            return text;
        }
    };
    let rest = bytes.split_off(valid);
    let text = String::from_utf8_lossy(bytes).into_owned();
    *bytes = rest;
    text
}

/// Forward live stderr; return whatever follows the traceback separator
async fn forward_stderr(stderr: tokio::process::ChildStderr, sink: OutputSink) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut traceback: Option<String> = None;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match traceback.as_mut() {
                Some(collected) => {
                    collected.push_str(&line);
                    collected.push('\n');
                }
                None if line == TRACEBACK_SEPARATOR => traceback = Some(String::new()),
                None => sink.stderr(&format!("{}\n", line)),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read interpreter stderr");
                break;
            }
        }
    }
    traceback.map(|t| t.trim_end().to_string()).unwrap_or_default()
}

#[cfg(unix)]
fn send_interrupt(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                debug!(pid, error = %e, "failed to deliver SIGINT");
            }
        }
        None => debug!("interpreter already exited before interrupt"),
    }
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) {
    debug!("cooperative interrupt unsupported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_utf8_keeps_split_sequence() {
        let mut bytes = "héllo".as_bytes().to_vec();
        let tail = bytes.split_off(2);
        assert_eq!(take_utf8(&mut bytes), "h");
        assert_eq!(bytes, vec![0xC3]);

        bytes.extend_from_slice(&tail);
        assert_eq!(take_utf8(&mut bytes), "éllo");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_bootstrap_markers_match_codec() {
        assert!(BOOTSTRAP.contains(crate::codec::INPUT_MARK));
        assert!(BOOTSTRAP.contains(crate::codec::PLOT_MARK));
        assert!(BOOTSTRAP.contains(crate::codec::SLEEP_MARK));
        for name in crate::instrument::RESERVED_NAMES {
            assert!(BOOTSTRAP.contains(name), "bootstrap lacks {}", name);
        }
    }
}
