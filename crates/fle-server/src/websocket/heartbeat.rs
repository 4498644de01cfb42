//! Liveness timing: the reader's renewable deadline and the writer's ping
//! ticker.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Read deadline renewed on every liveness frame.
#[derive(Debug, Clone, Copy)]
pub struct ReadDeadline {
    window: Duration,
    deadline: Instant,
}

impl ReadDeadline {
    /// Deadline `window` from now.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Instant::now() + window,
        }
    }

    /// Push the deadline to `window` from now.
    pub fn renew(&mut self) {
        self.deadline = Instant::now() + self.window;
    }

    /// The instant reads must complete by.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Ticker for writer pings. The first tick fires one `period` from now.
pub fn ping_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_after_window() {
        let deadline = ReadDeadline::new(Duration::from_secs(60));
        time::advance(Duration::from_secs(59)).await;
        assert!(Instant::now() < deadline.deadline());
        time::advance(Duration::from_secs(1)).await;
        assert_eq!(Instant::now(), deadline.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_deadline() {
        let mut deadline = ReadDeadline::new(Duration::from_secs(10));
        time::advance(Duration::from_secs(8)).await;
        deadline.renew();
        time::advance(Duration::from_secs(8)).await;
        assert_eq!(deadline.deadline() - Instant::now(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_skips_immediate_tick() {
        let start = Instant::now();
        let mut ticker = ping_ticker(Duration::from_secs(30));
        let _ = ticker.tick().await;
        assert_eq!(Instant::now() - start, Duration::from_secs(30));
        let _ = ticker.tick().await;
        assert_eq!(Instant::now() - start, Duration::from_secs(60));
    }
}
