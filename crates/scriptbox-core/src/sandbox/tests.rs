use super::*;
use crate::codec::INPUT_MARK;
use crate::interpreter::{Interpreter, ScriptedInterpreter};
use crate::protocol::{RunToken, SandboxMessage};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const INSTANCE: SandboxInstance = SandboxInstance::new(1);

async fn next(rx: &mut UnboundedReceiver<Envelope>) -> SandboxMessage {
    let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sandbox message within 5s")
        .expect("event channel open");
    assert_eq!(envelope.instance, INSTANCE);
    envelope.message
}

/// Collect messages until the run's terminal message
async fn until_terminal(rx: &mut UnboundedReceiver<Envelope>) -> Vec<SandboxMessage> {
    let mut messages = Vec::new();
    loop {
        let message = next(rx).await;
        let terminal = matches!(
            message,
            SandboxMessage::Done { .. } | SandboxMessage::Stopped { .. } | SandboxMessage::Error { .. }
        );
        messages.push(message);
        if terminal {
            return messages;
        }
    }
}

fn request(token: u64, code: &str) -> HostMessage {
    HostMessage::Run(RunRequest {
        token: RunToken::new(token),
        code: code.to_string(),
        instrumented: true,
        needs_graphics: code.contains("plt."),
    })
}

fn worker(interpreter: ScriptedInterpreter) -> (WorkerSandbox, UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let boxed: Box<dyn Interpreter> = Box::new(interpreter);
    (WorkerSandbox::spawn(INSTANCE, boxed, tx).unwrap(), rx)
}

fn fallback(interpreter: ScriptedInterpreter) -> (FallbackExecutor, UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let boxed: Box<dyn Interpreter> = Box::new(interpreter);
    (FallbackExecutor::spawn(INSTANCE, boxed, tx).unwrap(), rx)
}

async fn ready(executor: &mut dyn Executor, rx: &mut UnboundedReceiver<Envelope>) -> bool {
    executor.post(HostMessage::Init).unwrap();
    match next(rx).await {
        SandboxMessage::Ready { can_interrupt } => can_interrupt,
        other => panic!("expected ready, got {:?}", other),
    }
}

#[tokio::test]
async fn test_worker_runs_program() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    assert!(ready(&mut sandbox, &mut rx).await);

    sandbox.post(request(1, "print(\"hello\")")).unwrap();
    let messages = until_terminal(&mut rx).await;
    assert_eq!(
        messages,
        vec![
            SandboxMessage::Stdout {
                token: RunToken::new(1),
                data: "hello\n".into()
            },
            SandboxMessage::Done {
                token: RunToken::new(1)
            },
        ]
    );
}

#[tokio::test]
async fn test_run_before_init_is_rejected() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    sandbox.post(request(3, "print(\"x\")")).unwrap();
    assert_eq!(
        next(&mut rx).await,
        SandboxMessage::Error {
            token: RunToken::new(3),
            message: "sandbox not ready".into()
        }
    );
}

#[tokio::test]
async fn test_second_run_while_busy_is_rejected() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    ready(&mut sandbox, &mut rx).await;

    sandbox.post(request(1, "await __sleep__(0.2)\nprint(\"first\")")).unwrap();
    sandbox.post(request(2, "print(\"second\")")).unwrap();

    let messages = until_terminal(&mut rx).await;
    assert!(messages.contains(&SandboxMessage::Error {
        token: RunToken::new(2),
        message: "already running".into()
    }));
    let messages = until_terminal(&mut rx).await;
    assert_eq!(
        messages.last(),
        Some(&SandboxMessage::Done {
            token: RunToken::new(1)
        })
    );
}

#[tokio::test]
async fn test_worker_structured_input() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    ready(&mut sandbox, &mut rx).await;

    sandbox
        .post(request(5, "n = await __await_input__(\"N=\")\nprint(n)"))
        .unwrap();
    assert_eq!(
        next(&mut rx).await,
        SandboxMessage::InputRequest {
            token: RunToken::new(5),
            prompt: "N=".into()
        }
    );

    sandbox
        .post(HostMessage::InputResponse { value: "7".into() })
        .unwrap();
    let messages = until_terminal(&mut rx).await;
    assert_eq!(
        messages,
        vec![
            SandboxMessage::Stdout {
                token: RunToken::new(5),
                data: "7\n".into()
            },
            SandboxMessage::Done {
                token: RunToken::new(5)
            },
        ]
    );
}

#[tokio::test]
async fn test_input_closed_ends_with_eof_error() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    ready(&mut sandbox, &mut rx).await;

    sandbox
        .post(request(6, "n = await __await_input__(\"N=\")\nprint(n)"))
        .unwrap();
    assert!(matches!(
        next(&mut rx).await,
        SandboxMessage::InputRequest { .. }
    ));

    sandbox.post(HostMessage::InputClosed).unwrap();
    let messages = until_terminal(&mut rx).await;
    assert_eq!(
        messages,
        vec![SandboxMessage::Error {
            token: RunToken::new(6),
            message: "EOFError: EOF when reading a line".into()
        }]
    );
}

#[tokio::test]
async fn test_fallback_uses_text_markers() {
    let (mut executor, mut rx) = fallback(ScriptedInterpreter::new());
    ready(&mut executor, &mut rx).await;

    executor
        .post(request(2, "x = await __await_input__(\"Name? \")\nprint(x)"))
        .unwrap();
    assert_eq!(
        next(&mut rx).await,
        SandboxMessage::Stdout {
            token: RunToken::new(2),
            data: format!("{}Name? \n", INPUT_MARK)
        }
    );

    executor
        .post(HostMessage::InputResponse { value: "Ada".into() })
        .unwrap();
    let messages = until_terminal(&mut rx).await;
    assert_eq!(
        messages.first(),
        Some(&SandboxMessage::Stdout {
            token: RunToken::new(2),
            data: "Ada\n".into()
        })
    );
}

#[tokio::test]
async fn test_stop_interrupts_sleep() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    ready(&mut sandbox, &mut rx).await;

    sandbox.post(request(4, "await __sleep__(30)\nprint(\"late\")")).unwrap();
    assert_eq!(
        next(&mut rx).await,
        SandboxMessage::SleepBegin {
            token: RunToken::new(4)
        }
    );

    sandbox.post(HostMessage::Stop).unwrap();
    let messages = until_terminal(&mut rx).await;
    assert_eq!(
        messages,
        vec![
            SandboxMessage::SleepEnd {
                token: RunToken::new(4)
            },
            SandboxMessage::Stopped {
                token: RunToken::new(4)
            },
        ]
    );

    // The flag is cleared for the next run
    sandbox.post(request(5, "print(\"again\")")).unwrap();
    let messages = until_terminal(&mut rx).await;
    assert_eq!(
        messages.last(),
        Some(&SandboxMessage::Done {
            token: RunToken::new(5)
        })
    );
}

#[tokio::test]
async fn test_init_failure_reports_error_without_token() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new().failing_init("no interpreter"));
    sandbox.post(HostMessage::Init).unwrap();
    match next(&mut rx).await {
        SandboxMessage::Error { token, message } => {
            assert!(token.is_none());
            assert!(message.contains("no interpreter"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_shows_then_leftover_flush() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    ready(&mut sandbox, &mut rx).await;

    let code = "plt.plot([1])\nplt.show()\nplt.plot([2])\nplt.show()\nplt.plot([3])";
    sandbox.post(request(6, code)).unwrap();
    let messages = until_terminal(&mut rx).await;

    let plots: Vec<&str> = messages
        .iter()
        .filter_map(|m| match m {
            SandboxMessage::Plot { data, .. } => Some(data.data()),
            _ => None,
        })
        .collect();
    assert_eq!(
        plots,
        vec![
            "data:image/x-scripted-figure;figure=1",
            "data:image/x-scripted-figure;figure=2",
            "data:image/x-scripted-figure;figure=3",
        ]
    );

    // Graphics state does not leak into the next run
    sandbox.post(request(7, "plt.show()")).unwrap();
    let messages = until_terminal(&mut rx).await;
    assert!(!messages.iter().any(|m| matches!(m, SandboxMessage::Plot { .. })));
}

#[tokio::test]
async fn test_terminated_sandbox_refuses_messages() {
    let (mut sandbox, mut rx) = worker(ScriptedInterpreter::new());
    ready(&mut sandbox, &mut rx).await;

    sandbox.terminate();
    sandbox.terminate();
    assert_eq!(
        sandbox.post(HostMessage::Stop),
        Err(SandboxError::Terminated)
    );
}

#[tokio::test]
async fn test_handle_state_transitions() {
    let (sandbox, mut rx) = worker(ScriptedInterpreter::new());
    let mut handle = SandboxHandle::new(Box::new(sandbox));
    assert_eq!(handle.state(), SandboxState::Uninitialized);
    assert_eq!(
        handle.dispatch(RunRequest {
            token: RunToken::new(1),
            code: String::new(),
            instrumented: true,
            needs_graphics: false,
        }),
        Err(SandboxError::NotReady)
    );

    handle.begin_init().unwrap();
    assert_eq!(handle.state(), SandboxState::Initializing);
    let SandboxMessage::Ready { can_interrupt } = next(&mut rx).await else {
        panic!("expected ready");
    };
    handle.mark_ready(can_interrupt);
    assert!(handle.is_ready());
    assert!(handle.can_interrupt());

    let run = RunRequest {
        token: RunToken::new(1),
        code: "pass".into(),
        instrumented: true,
        needs_graphics: false,
    };
    handle.dispatch(run.clone()).unwrap();
    assert_eq!(handle.state(), SandboxState::Busy);
    assert_eq!(handle.dispatch(run), Err(SandboxError::Busy));

    handle.mark_idle();
    assert!(handle.is_ready());
    handle.terminate();
    assert_eq!(handle.state(), SandboxState::Terminated);
}
