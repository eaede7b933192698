//! Maintenance scheduling
//!
//! Every periodic task shares one cancellation token so shutdown stops them
//! as a group. Shutdown installs a fresh token, so the scheduler can be
//! started again.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owner of the maintenance tasks
#[derive(Default)]
pub struct Scheduler {
    token: Mutex<CancellationToken>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token every scheduled task must observe
    pub fn token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// Track a spawned task
    pub fn register(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().push((name, handle));
    }

    /// Names of the tracked tasks
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.lock().iter().map(|(name, _)| *name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Cancel every task and wait for them to exit
    pub async fn shutdown(&self) {
        let token = std::mem::take(&mut *self.token.lock());
        token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Maintenance task ended abnormally");
            }
        }
        info!(tasks = count, "Maintenance tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::spawn_periodic;
    use std::time::Duration;

    fn start_tasks(scheduler: &Scheduler) {
        for name in ["a", "b"] {
            let handle = spawn_periodic(name, Duration::from_secs(60), scheduler.token(), || async { Ok(()) });
            scheduler.register(name, handle);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_every_task() {
        let scheduler = Scheduler::new();
        let token = scheduler.token();
        start_tasks(&scheduler);
        assert_eq!(scheduler.task_names(), vec!["a", "b"]);

        scheduler.shutdown().await;
        assert!(scheduler.is_empty());
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_shutdown() {
        let scheduler = Scheduler::new();
        start_tasks(&scheduler);
        scheduler.shutdown().await;

        let token = scheduler.token();
        assert!(!token.is_cancelled());
        start_tasks(&scheduler);
        assert_eq!(scheduler.task_names(), vec!["a", "b"]);

        // Tasks of the second run are alive until the next shutdown
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(!token.is_cancelled());
        scheduler.shutdown().await;
        assert!(token.is_cancelled());
    }
}
