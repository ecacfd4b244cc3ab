//! Negotiation deadline: one wall-clock bound over the whole adapter cascade.

use std::time::Duration;

use tokio::time::Instant;

use crate::timer::OneShotTimer;

#[derive(Debug)]
pub struct Deadline {
    timeout: Duration,
    armed_at: Option<Instant>,
    timer: OneShotTimer,
}

impl Deadline {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed_at: None,
            timer: OneShotTimer::new(),
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a fresh countdown, discarding any previous one.
    pub fn arm(&mut self) {
        self.armed_at = Some(Instant::now());
        self.timer.schedule(self.timeout);
    }

    /// Returns whether a countdown was running.
    pub fn disarm(&mut self) -> bool {
        self.armed_at = None;
        self.timer.cancel()
    }

    pub const fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    /// Resolves with the time spent negotiating once the deadline passes.
    /// Pending forever while disarmed.
    pub async fn expired(&self) -> Duration {
        self.timer.fired().await;
        self.armed_at.map_or(self.timeout, |at| at.elapsed())
    }
}
