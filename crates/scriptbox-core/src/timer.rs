//! Pausable execution budget
//!
//! The budget only drains while the program is actually running: waits on
//! the user (input) and cooperative sleeps pause it. The timer never
//! schedules anything itself; it reports a deadline and the session
//! sleeps until it.

use std::time::Duration;
use tokio::time::Instant;

/// Outcome of resuming the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumed {
    /// Running again; the deadline to wait for, if the run is limited
    Armed(Option<Instant>),
    /// The budget was already used up
    Expired,
    /// Nothing changed (already running or already expired)
    Unchanged,
}

/// Per-run execution timer
#[derive(Debug, Clone)]
pub struct ExecTimer {
    budget: Option<Duration>,
    consumed: Duration,
    /// Start of the current running segment; `None` while paused
    segment_start: Option<Instant>,
    triggered: bool,
}

impl ExecTimer {
    /// Start a running segment now; `None` budget means unlimited
    pub fn start(budget: Option<Duration>, now: Instant) -> Self {
        Self {
            budget,
            consumed: Duration::ZERO,
            segment_start: Some(now),
            triggered: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.segment_start.is_none()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// Close the running segment; returns false if already paused or expired
    pub fn pause(&mut self, now: Instant) -> bool {
        if self.triggered {
            return false;
        }
        match self.segment_start.take() {
            Some(start) => {
                self.consumed += now.saturating_duration_since(start);
                true
            }
            None => false,
        }
    }

    /// Open a new running segment
    pub fn resume(&mut self, now: Instant) -> Resumed {
        if self.triggered || self.segment_start.is_some() {
            return Resumed::Unchanged;
        }
        if self.budget.is_some_and(|budget| self.consumed >= budget) {
            return Resumed::Expired;
        }
        self.segment_start = Some(now);
        Resumed::Armed(self.deadline())
    }

    /// When the budget runs out if nothing pauses the timer
    pub fn deadline(&self) -> Option<Instant> {
        if self.triggered {
            return None;
        }
        let start = self.segment_start?;
        let remaining = self.budget?.saturating_sub(self.consumed);
        Some(start + remaining)
    }

    /// Budget left at `now`; `None` when unlimited
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.budget
            .map(|budget| budget.saturating_sub(self.accounted(now)))
    }

    /// Running time so far, excluding paused intervals
    pub fn accounted(&self, now: Instant) -> Duration {
        let running = self
            .segment_start
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
        self.consumed + running
    }

    /// Mark the budget exhausted; true only the first time
    pub fn expire(&mut self, now: Instant) -> bool {
        if self.triggered {
            return false;
        }
        self.pause(now);
        self.triggered = true;
        true
    }

    /// Stop accounting and return the total running time
    pub fn release(&mut self, now: Instant) -> Duration {
        self.pause(now);
        self.segment_start = None;
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_deadline_covers_full_budget() {
        let t0 = Instant::now();
        let timer = ExecTimer::start(Some(ms(1000)), t0);
        assert_eq!(timer.deadline(), Some(t0 + ms(1000)));
        assert_eq!(timer.remaining(t0 + ms(300)), Some(ms(700)));
    }

    #[test]
    fn test_pause_excludes_waiting_time() {
        let t0 = Instant::now();
        let mut timer = ExecTimer::start(Some(ms(1000)), t0);

        assert!(timer.pause(t0 + ms(200)));
        assert!(timer.is_paused());
        assert_eq!(timer.deadline(), None);

        // Five seconds waiting on the user
        let resumed = timer.resume(t0 + ms(5200));
        assert_eq!(resumed, Resumed::Armed(Some(t0 + ms(6000))));
        assert_eq!(timer.accounted(t0 + ms(5300)), ms(300));
    }

    #[test]
    fn test_double_pause_and_resume_are_noops() {
        let t0 = Instant::now();
        let mut timer = ExecTimer::start(Some(ms(1000)), t0);

        assert_eq!(timer.resume(t0 + ms(10)), Resumed::Unchanged);
        assert!(timer.pause(t0 + ms(100)));
        assert!(!timer.pause(t0 + ms(400)));
        assert_eq!(timer.accounted(t0 + ms(900)), ms(100));
    }

    #[test]
    fn test_remaining_is_monotonic_and_never_negative() {
        let t0 = Instant::now();
        let mut timer = ExecTimer::start(Some(ms(500)), t0);
        let mut last = timer.remaining(t0).unwrap();

        for step in 1..=20u64 {
            let now = t0 + ms(step * 50);
            if step % 3 == 0 {
                timer.pause(now);
            } else if step % 3 == 1 {
                timer.resume(now);
            }
            let remaining = timer.remaining(now).unwrap();
            assert!(remaining <= last, "remaining grew at step {}", step);
            last = remaining;
        }
        assert_eq!(timer.remaining(t0 + ms(60_000)), Some(Duration::ZERO));
    }

    #[test]
    fn test_resume_with_exhausted_budget_expires_immediately() {
        let t0 = Instant::now();
        let mut timer = ExecTimer::start(Some(ms(100)), t0);
        timer.pause(t0 + ms(150));

        assert_eq!(timer.resume(t0 + ms(400)), Resumed::Expired);
        assert!(timer.expire(t0 + ms(400)));
    }

    #[test]
    fn test_expires_at_most_once() {
        let t0 = Instant::now();
        let mut timer = ExecTimer::start(Some(ms(100)), t0);

        assert!(timer.expire(t0 + ms(100)));
        assert!(!timer.expire(t0 + ms(101)));
        assert!(timer.is_triggered());
        assert_eq!(timer.deadline(), None);
        // Pause and resume are ignored once expired
        assert!(!timer.pause(t0 + ms(120)));
        assert_eq!(timer.resume(t0 + ms(130)), Resumed::Unchanged);
    }

    #[test]
    fn test_unlimited_budget_still_accounts_time() {
        let t0 = Instant::now();
        let mut timer = ExecTimer::start(None, t0);
        assert_eq!(timer.deadline(), None);
        assert_eq!(timer.remaining(t0 + ms(50)), None);

        timer.pause(t0 + ms(50));
        assert_eq!(timer.resume(t0 + ms(80)), Resumed::Armed(None));
        assert_eq!(timer.release(t0 + ms(100)), ms(70));
    }
}
