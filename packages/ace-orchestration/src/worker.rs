//! Fixed-size worker pool
//!
//! Each worker loops: dequeue (bounded wait) → run that session's next stage
//! → commit and requeue, or settle the session → repeat. Shutdown only
//! interrupts the dequeue wait; a stage in progress always runs to its end.

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::orchestrator::AceOrchestrator;
use crate::session::SessionStatus;

/// Per-worker counters, returned on shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: String,
    pub completed: usize,
    pub completed_with_warnings: usize,
    pub failed: usize,
    pub aborted: usize,
    pub paused: usize,
    /// Stages committed with more of the session still queued
    pub stages_yielded: usize,
    pub errors: usize,
}

impl WorkerStats {
    fn record(&mut self, status: SessionStatus) {
        match status {
            SessionStatus::Completed => self.completed += 1,
            SessionStatus::CompletedWithWarnings => self.completed_with_warnings += 1,
            SessionStatus::Failed => self.failed += 1,
            SessionStatus::Aborted => self.aborted += 1,
            SessionStatus::Paused => self.paused += 1,
            SessionStatus::Running => self.stages_yielded += 1,
        }
    }

    /// Runs that left the session terminal or paused
    pub fn sessions_run(&self) -> usize {
        self.completed + self.completed_with_warnings + self.failed + self.aborted + self.paused
    }
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Start `count` workers against `orchestrator`
    pub fn spawn(orchestrator: Arc<AceOrchestrator>, count: usize) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..count.max(1))
            .map(|idx| {
                let worker_id = format!("worker-{}", idx);
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&orchestrator),
                    shutdown.child_token(),
                ))
            })
            .collect();
        info!(workers = count.max(1), "Worker pool started");
        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop dequeuing and wait for every worker to return
    pub async fn shutdown(self) -> Vec<WorkerStats> {
        self.shutdown.cancel();
        let mut stats = Vec::with_capacity(self.handles.len());
        for joined in join_all(self.handles).await {
            match joined {
                Ok(worker) => stats.push(worker),
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
        info!(workers = stats.len(), "Worker pool stopped");
        stats
    }
}

async fn worker_loop(
    worker_id: String,
    orchestrator: Arc<AceOrchestrator>,
    shutdown: CancellationToken,
) -> WorkerStats {
    let wait = orchestrator.config().queue.wake_interval();
    let mut stats = WorkerStats {
        worker_id: worker_id.clone(),
        ..WorkerStats::default()
    };

    loop {
        let entry = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = orchestrator.next_entry(wait) => next,
        };
        let Some(entry) = entry else {
            continue;
        };

        debug!(worker = %worker_id, entry_id = %entry.entry_id, "Worker claimed entry");
        match orchestrator.run_entry(entry, &worker_id).await {
            Ok(outcome) => stats.record(outcome.status),
            Err(e) => {
                stats.errors += 1;
                debug!(worker = %worker_id, error = %e, "Entry not run");
            }
        }
    }

    stats
}

/// Wait until the orchestrator has no queued work and no live sessions
///
/// Returns `false` if `timeout` elapses first.
pub async fn drain(orchestrator: &AceOrchestrator, poll: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if orchestrator.is_idle() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AceConfig;
    use holofs_store::{ArtifactStore, InMemoryArtifactStore};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_drains_queue() {
        let mut config = AceConfig::default();
        config.queue.wake_interval_ms = 10;
        let store = Arc::new(InMemoryArtifactStore::default());
        for i in 0..6 {
            store
                .put(&format!("/calls/{}.txt", i), format!("Alice: call {} went fine.", i).as_bytes())
                .await
                .unwrap();
        }
        let orch = Arc::new(AceOrchestrator::new(Arc::new(config), store));
        for i in 0..6 {
            orch.submit(&format!("/calls/{}.txt", i), &[], 0).await.unwrap();
        }

        let pool = WorkerPool::spawn(Arc::clone(&orch), 3);
        assert_eq!(pool.size(), 3);
        assert!(drain(&orch, Duration::from_millis(10), Duration::from_secs(10)).await);

        let stats = pool.shutdown().await;
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.iter().map(|s| s.completed).sum::<usize>(), 6);
        // Five stages per session, all but the last followed by a yield
        assert_eq!(stats.iter().map(|s| s.stages_yielded).sum::<usize>(), 24);
        assert_eq!(orch.history().len(), 6);
    }

    #[tokio::test]
    async fn test_shutdown_idle_pool() {
        let orch = Arc::new(AceOrchestrator::new(
            Arc::new(AceConfig::default()),
            Arc::new(InMemoryArtifactStore::default()),
        ));
        let pool = WorkerPool::spawn(orch, 2);
        let stats = pool.shutdown().await;
        assert!(stats.iter().all(|s| s.sessions_run() == 0));
    }
}
