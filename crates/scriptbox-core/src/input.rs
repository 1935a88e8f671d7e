//! Input arbitration
//!
//! At most one input request is outstanding per session. The UI receives
//! an [`InputResolver`] and answers through it; the orchestrator awaits the
//! matching [`PendingInput`]. Dropping the pending side (cancellation)
//! makes any later answer a no-op.

use crate::protocol::RunToken;
use std::future;
use tokio::sync::oneshot;
use tracing::debug;

/// Answer to an input request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputReply {
    /// The user submitted a value
    Value(String),
    /// The affordance went away without a value
    Cancelled,
}

/// Handed to the UI; resolves the pending input request once
#[derive(Debug)]
pub struct InputResolver {
    token: RunToken,
    tx: oneshot::Sender<String>,
}

impl InputResolver {
    /// Run the request belongs to
    pub fn token(&self) -> RunToken {
        self.token
    }

    /// Whether the request was already cancelled
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes once the request is cancelled; cancel-safe
    pub async fn cancelled(&mut self) {
        self.tx.closed().await
    }

    /// Submit a value; returns false if the request was cancelled meanwhile
    pub fn resolve(self, value: impl Into<String>) -> bool {
        let delivered = self.tx.send(value.into()).is_ok();
        if !delivered {
            debug!(token = %self.token, "input resolved after cancellation");
        }
        delivered
    }
}

/// The orchestrator's side of an outstanding input request
#[derive(Debug)]
pub struct PendingInput {
    token: RunToken,
    prompt: String,
    rx: oneshot::Receiver<String>,
}

impl PendingInput {
    pub fn new(token: RunToken, prompt: impl Into<String>) -> (Self, InputResolver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                token,
                prompt: prompt.into(),
                rx,
            },
            InputResolver { token, tx },
        )
    }

    pub fn token(&self) -> RunToken {
        self.token
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Wait for the UI; cancel-safe
    pub async fn wait(&mut self) -> InputReply {
        match (&mut self.rx).await {
            Ok(value) => InputReply::Value(value),
            Err(_) => InputReply::Cancelled,
        }
    }
}

/// Holds the single outstanding request
#[derive(Debug, Default)]
pub struct InputSlot {
    pending: Option<PendingInput>,
}

impl InputSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingInput> {
        self.pending.as_ref()
    }

    /// Open a request; `None` if one is already outstanding
    pub fn open(&mut self, token: RunToken, prompt: &str) -> Option<InputResolver> {
        if self.pending.is_some() {
            return None;
        }
        let (pending, resolver) = PendingInput::new(token, prompt);
        self.pending = Some(pending);
        Some(resolver)
    }

    /// Drop the outstanding request; returns whether there was one
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Wait for the outstanding request to be answered
    ///
    /// Pends forever while nothing is outstanding, so it can sit in a
    /// `select!` loop. Cancel-safe: the request stays in the slot until a
    /// reply arrives.
    pub async fn next_reply(&mut self) -> (RunToken, InputReply) {
        let Some(pending) = self.pending.as_mut() else {
            return future::pending().await;
        };
        let reply = pending.wait().await;
        let token = pending.token();
        self.pending = None;
        (token, reply)
    }
}
