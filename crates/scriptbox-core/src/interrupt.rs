use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Why a run was stopped before it finished on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// User asked to stop
    User,
    /// Accounted execution time exceeded the budget
    Timeout,
    /// A newer run replaced this one
    Superseded,
    /// The session is shutting down
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Timeout => write!(f, "timeout"),
            Self::Superseded => write!(f, "superseded"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Cooperative interrupt flag shared between host and sandbox
///
/// The host raises it; interpreter code polls [`is_raised`](Self::is_raised)
/// at safe points, and suspended host calls wait on [`raised`](Self::raised).
/// The sandbox clears it after each run.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    inner: Arc<FlagInner>,
}

#[derive(Debug, Default)]
struct FlagInner {
    raised: AtomicBool,
    notify: Notify,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Reset for the next run
    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is raised
    pub async fn raised(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_raise_and_clear() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_raised());

        let shared = flag.clone();
        shared.raise();
        assert!(flag.is_raised());

        flag.clear();
        assert!(!shared.is_raised());
    }

    #[tokio::test]
    async fn test_raised_resolves_immediately_when_already_set() {
        let flag = InterruptFlag::new();
        flag.raise();
        tokio::time::timeout(Duration::from_millis(100), flag.raised())
            .await
            .expect("flag already raised");
    }

    #[tokio::test]
    async fn test_raised_wakes_waiter() {
        let flag = InterruptFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.raised().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flag.raise();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
