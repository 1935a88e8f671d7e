//! Run command: execute a script in a sandbox session

use crate::args::{InterpreterChoice, RunArgs};
use crate::signal_handler::SignalHandler;
use crate::terminal::TerminalUi;
use anyhow::{Context, Result};
use scriptbox_core::{
    Interpreter, InterpreterLauncher, Launcher, PythonInterpreter, RunnerConfig, RunnerError,
    RunnerResult, ScriptedInterpreter, Session,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Execute the run command, returning the process exit status
pub async fn execute(args: RunArgs) -> Result<i32> {
    let config = build_config(&args)?;
    let source = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("could not read {}", args.file.display()))?;

    if let Some(dir) = &args.plot_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("could not create {}", dir.display()))?;
    }

    debug!(file = %args.file.display(), ?config, "starting run");
    let launcher = launcher(args.interpreter, &config);
    let ui = Arc::new(TerminalUi::new(args.plot_dir.clone()));
    let (handle, task) = Session::spawn(config, launcher, ui);

    let signals = match SignalHandler::start(handle.clone()) {
        Ok(signals) => Some(signals),
        Err(e) => {
            warn!(error = %e, "Ctrl+C handling unavailable");
            None
        }
    };

    let result = handle.run_to_completion(source).await;

    if let Some(signals) = signals {
        signals.stop().await;
    }
    handle.shutdown().await;
    if task.await.is_err() {
        debug!("session task ended abnormally");
    }

    match result {
        Ok(report) => Ok(report.outcome.exit_code()),
        // The session has already told the user
        Err(RunnerError::EmptySource) => Ok(1),
        Err(e) => Err(e.into()),
    }
}

/// Load configuration and apply command-line overrides
pub fn build_config(args: &RunArgs) -> RunnerResult<RunnerConfig> {
    let mut config = RunnerConfig::load(args.config.as_deref())?;
    if let Some(timeout) = args.timeout {
        config.exec_timeout = timeout;
    }
    if let Some(executor) = args.executor {
        config.executor = executor;
    }
    if let Some(python) = &args.python {
        config.python.program = python.clone();
    }
    config.validate()?;
    Ok(config)
}

fn launcher(choice: InterpreterChoice, config: &RunnerConfig) -> Arc<dyn Launcher> {
    match choice {
        InterpreterChoice::Python => {
            let python = config.python.clone();
            Arc::new(InterpreterLauncher::new(move || -> Box<dyn Interpreter> {
                Box::new(PythonInterpreter::new(python.clone()))
            }))
        }
        InterpreterChoice::Scripted => {
            Arc::new(InterpreterLauncher::new(|| -> Box<dyn Interpreter> {
                Box::new(ScriptedInterpreter::new())
            }))
        }
    }
}
