//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default bound on draining tracked tasks.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened to the tracked tasks during a drain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that finished within the timeout.
    pub completed: Vec<String>,
    /// Tasks still running at the deadline; these were aborted.
    pub aborted: Vec<String>,
}

/// Owns the server-wide shutdown token and the background tasks that
/// should finish before the process exits.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator with the default drain timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Coordinator with a custom drain timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            timeout,
        }
    }

    /// A clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Track `handle` under `name` so [`drain`](Self::drain) waits for it.
    pub fn track(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.lock().push((name.into(), handle));
    }

    /// Number of tracked tasks not yet drained.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, then wait for every tracked task up to the timeout.
    /// Tasks still running at the deadline are aborted.
    pub async fn drain(&self) -> DrainReport {
        self.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            task_count = tasks.len(),
            timeout_secs = self.timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let deadline = Instant::now() + self.timeout;
        let mut report = DrainReport::default();
        for (name, mut handle) in tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_ok() {
                report.completed.push(name);
            } else {
                warn!(task = %name, "task did not stop before the shutdown deadline, aborting");
                handle.abort();
                report.aborted.push(name);
            }
        }
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::default();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.tracked(), 0);
    }

    #[test]
    fn shutdown_cancels_every_token() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        coord.track("server", tokio::spawn(async move { token.cancelled().await }));
        assert_eq!(coord.tracked(), 1);

        let report = coord.drain().await;
        assert_eq!(report.completed, vec!["server".to_string()]);
        assert!(report.aborted.is_empty());
        assert_eq!(coord.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_stragglers() {
        let coord = ShutdownCoordinator::with_timeout(Duration::from_millis(100));
        let token = coord.token();
        coord.track("polite", tokio::spawn(async move { token.cancelled().await }));
        coord.track(
            "stubborn",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(300)).await;
            }),
        );

        let report = coord.drain().await;
        assert_eq!(report.completed, vec!["polite".to_string()]);
        assert_eq!(report.aborted, vec!["stubborn".to_string()]);
    }
}
