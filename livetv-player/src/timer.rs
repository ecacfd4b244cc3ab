use std::time::Duration;

use tokio::time::Instant;

/// A single cancellable expiry, polled from the session loop.
///
/// `fired()` borrows the timer immutably and is recreated on every loop turn,
/// so rescheduling or cancelling between turns takes effect immediately.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    at: Option<Instant>,
}

impl OneShotTimer {
    #[must_use]
    pub const fn new() -> Self {
        Self { at: None }
    }

    /// Arm (or re-arm) the timer to fire `after` from now.
    pub fn schedule(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    /// Returns whether the timer was armed.
    pub fn cancel(&mut self) -> bool {
        self.at.take().is_some()
    }

    pub const fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Resolves at the scheduled instant; never resolves while unarmed.
    /// Does not disarm: the caller decides what firing means.
    pub async fn fired(&self) {
        match self.at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_scheduled_instant() {
        let mut timer = OneShotTimer::new();
        timer.schedule(Duration::from_secs(3));
        let start = Instant::now();
        timer.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_timer_never_fires() {
        let mut timer = OneShotTimer::new();
        timer.schedule(Duration::from_secs(1));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        let result = tokio::time::timeout(Duration::from_secs(60), timer.fired()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_pushes_expiry_back() {
        let mut timer = OneShotTimer::new();
        timer.schedule(Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(2)).await;
        timer.schedule(Duration::from_secs(3));
        assert_eq!(timer.remaining(), Some(Duration::from_secs(3)));
    }
}
