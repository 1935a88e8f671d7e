//! Runs through the system Python adapter; skipped without `python3`

mod common;

use common::{RecordingUi, quick_config, within};
use scriptbox_core::{
    Interpreter, InterpreterLauncher, OutputStream, PythonConfig, PythonInterpreter, RunOutcome,
    RunnerConfig, Session, SessionHandle, StopReason,
};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

fn python_available() -> bool {
    let program = PythonConfig::default().program;
    let available = Command::new(&program)
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success());
    if !available {
        eprintln!("skipping: {} not available", program);
    }
    available
}

fn matplotlib_available() -> bool {
    if !python_available() {
        return false;
    }
    let program = PythonConfig::default().program;
    let available = Command::new(&program)
        .args(["-c", "import matplotlib"])
        .output()
        .is_ok_and(|output| output.status.success());
    if !available {
        eprintln!("skipping: matplotlib not available");
    }
    available
}

fn python_session(config: RunnerConfig, ui: Arc<RecordingUi>) -> SessionHandle {
    let python = config.python.clone();
    let launcher = Arc::new(InterpreterLauncher::new(move || -> Box<dyn Interpreter> {
        Box::new(PythonInterpreter::new(python.clone()))
    }));
    let (handle, _task) = Session::spawn(config, launcher, ui);
    handle
}

#[tokio::test]
async fn test_python_print_and_input() {
    if !python_available() {
        return;
    }
    let ui = RecordingUi::answering(&["Ada"], Duration::from_millis(20));
    let handle = python_session(quick_config(), ui.clone());

    let source = "name = input(\"Name? \")\nprint(\"hello\", name)\n";
    let report = within(handle.run_to_completion(source)).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(ui.prompts(), vec!["Name? ".to_string()]);
    assert_eq!(ui.text(OutputStream::Stdout), "hello Ada\n");
}

#[tokio::test]
async fn test_python_sleep_is_not_accounted() {
    if !python_available() {
        return;
    }
    let ui = RecordingUi::new();
    let config = RunnerConfig {
        exec_timeout: Duration::from_secs(2),
        ..quick_config()
    };
    let handle = python_session(config, ui.clone());

    let source = "import time\ntime.sleep(2.5)\nprint(\"done\")\n";
    let report = within(handle.run_to_completion(source)).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(ui.text(OutputStream::Stdout), "done\n");
}

#[tokio::test]
async fn test_python_error_carries_the_traceback() {
    if !python_available() {
        return;
    }
    let ui = RecordingUi::new();
    let handle = python_session(quick_config(), ui.clone());

    let report = within(handle.run_to_completion("print(\"start\")\nx = 1 / 0\n"))
        .await
        .unwrap();
    match report.outcome {
        RunOutcome::Failed(message) => {
            assert!(message.starts_with("Traceback"), "{}", message);
            assert!(message.ends_with("ZeroDivisionError: division by zero"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(ui.text(OutputStream::Stdout), "start\n");
}

#[tokio::test]
async fn test_python_busy_loop_times_out() {
    if !python_available() {
        return;
    }
    let ui = RecordingUi::new();
    let config = RunnerConfig {
        exec_timeout: Duration::from_millis(500),
        stop_grace: Duration::from_millis(500),
        ..quick_config()
    };
    let handle = python_session(config, ui.clone());

    let report = within(handle.run_to_completion("while True:\n    pass\n"))
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Stopped(StopReason::Timeout));
    assert!(
        ui.text(OutputStream::Notice)
            .contains("time limit exceeded (0.5 s)")
    );

    let report = within(handle.run_to_completion("print(\"again\")\n"))
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_python_figures_survive_an_exception() {
    if !matplotlib_available() {
        return;
    }
    let ui = RecordingUi::new();
    let handle = python_session(quick_config(), ui.clone());

    let source = "import matplotlib.pyplot as plt\nplt.plot([1, 2])\nraise ValueError(\"x\")\n";
    let report = within(handle.run_to_completion(source)).await.unwrap();
    match report.outcome {
        RunOutcome::Failed(message) => assert!(message.ends_with("ValueError: x"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
    let images = ui.images();
    assert_eq!(images.len(), 1);
    assert!(images[0].png_base64().is_some());
}

#[tokio::test]
async fn test_python_two_shows_give_two_plots() {
    if !matplotlib_available() {
        return;
    }
    let ui = RecordingUi::new();
    let handle = python_session(quick_config(), ui.clone());

    let source = "import matplotlib.pyplot as plt\nplt.plot([1])\nplt.show()\nplt.plot([2])\nplt.show()\n";
    let report = within(handle.run_to_completion(source)).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(ui.images().len(), 2);
}

#[tokio::test]
async fn test_python_closed_input_raises_eof_error() {
    if !python_available() {
        return;
    }
    let ui = RecordingUi::closing_input();
    let config = RunnerConfig {
        exec_timeout: Duration::ZERO,
        ..quick_config()
    };
    let handle = python_session(config, ui.clone());

    let report = within(handle.run_to_completion("n = input(\"N=\")\nprint(n)\n"))
        .await
        .unwrap();
    match report.outcome {
        RunOutcome::Failed(message) => {
            assert!(message.ends_with("EOFError: EOF when reading a line"), "{}", message)
        }
        other => panic!("expected failure, got {:?}", other),
    }
}
