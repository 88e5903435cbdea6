//! Background task lifecycle
//!
//! Centralizes the governance layer's background work (cache sweep, drain
//! helpers) on tokio-util primitives: `CancellationToken` for hierarchical
//! shutdown signaling and `TaskTracker` for awaiting spawned tasks.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Coordinates cancellation and completion of background tasks
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    cancel_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Child token, cancelled when shutdown begins
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Whether shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Number of tracked tasks still running
    pub fn active_tasks(&self) -> usize {
        self.task_tracker.len()
    }

    /// Spawn and track a background task
    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        debug!("[SHUTDOWN] spawning tracked task: {}", name);
        tokio::spawn(self.task_tracker.track_future(future))
    }

    /// Spawn a tracked task that runs `task` every `period` until shutdown
    ///
    /// The first run happens one full period after the spawn, not immediately.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        mut task: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let token = self.child_token();
        self.spawn(name, async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("[SHUTDOWN] periodic task '{}' stopping", name);
                        break;
                    }
                    _ = ticker.tick() => task().await,
                }
            }
        })
    }

    /// Cancel all tokens and wait up to `timeout` for tracked tasks to finish
    ///
    /// Returns `true` if everything completed before the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!(
            "[SHUTDOWN] initiating, {} active tasks, {}s timeout",
            self.task_tracker.len(),
            timeout.as_secs()
        );
        self.cancel_token.cancel();
        self.task_tracker.close();

        tokio::select! {
            _ = self.task_tracker.wait() => {
                info!("[SHUTDOWN] all tasks completed");
                true
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    "[SHUTDOWN] timeout, {} tasks still active",
                    self.task_tracker.len()
                );
                false
            }
        }
    }
}
