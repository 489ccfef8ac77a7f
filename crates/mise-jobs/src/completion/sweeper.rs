//! Background eviction of expired completion records.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use mise_core::{Error, Result};

use super::{CompletionGuard, CompletionService};

/// Handle for controlling a running sweeper.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its task to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send sweeper shutdown signal".into()))?;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Sweeper task failed: {e}")))
    }
}

/// Periodically evicts expired completion records and stale guard claims.
pub struct CompletionSweeper;

impl CompletionSweeper {
    /// Spawn the sweep loop on the current runtime.
    pub fn start(service: Arc<CompletionService>, guard: Arc<CompletionGuard>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let period = service.config().sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(interval_secs = period.as_secs(), "Completion sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        Self::sweep_once(&service, &guard);
                    }
                }
            }
            info!("Completion sweeper stopped");
        });

        SweeperHandle { shutdown_tx, task }
    }

    /// Run a single sweep. Returns the number of evicted records.
    pub fn sweep_once(service: &CompletionService, guard: &CompletionGuard) -> usize {
        let evicted = service.sweep();
        let pruned = guard.prune(Utc::now(), service.config().stale_ttl);
        if !evicted.is_empty() || pruned > 0 {
            debug!(
                evicted = evicted.len(),
                pruned_claims = pruned,
                remaining = service.tracker().len(),
                "Completion sweep"
            );
        }
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::completion::CompletionConfig;
    use crate::memory::{MemoryNoteStore, RecordingBroadcaster, RecordingCleanup};
    use mise_core::WorkerType;

    fn service(config: CompletionConfig) -> Arc<CompletionService> {
        Arc::new(
            CompletionService::new(
                Arc::new(MemoryNoteStore::new()),
                Arc::new(RecordingBroadcaster::new()),
                Arc::new(RecordingCleanup::new()),
            )
            .with_config(config),
        )
    }

    #[tokio::test]
    async fn test_sweep_once_evicts_completed_with_zero_retention() {
        let service = service(CompletionConfig::default().with_retention(Duration::ZERO));
        let guard = CompletionGuard::new();

        service.initialize_note_completion("done", "i1", None).await;
        service.initialize_note_completion("busy", "i1", None).await;
        for worker in WorkerType::ALL {
            service.mark_worker_completed("done", worker).await;
        }

        assert_eq!(CompletionSweeper::sweep_once(&service, &guard), 1);
        assert!(service.get_note_completion_status("done").is_none());
        assert!(service.get_note_completion_status("busy").is_some());
    }

    #[tokio::test]
    async fn test_sweep_once_evicts_stale_incomplete() {
        let service = service(CompletionConfig::default().with_stale_ttl(Duration::ZERO));
        let guard = CompletionGuard::new();
        guard.claim(WorkerType::Instruction, "n1");

        service.initialize_note_completion("n1", "i1", None).await;

        assert_eq!(CompletionSweeper::sweep_once(&service, &guard), 1);
        assert!(service.tracker().is_empty());
        assert!(guard.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval_and_shuts_down() {
        let config = CompletionConfig::default()
            .with_stale_ttl(Duration::ZERO)
            .with_sweep_interval(Duration::from_secs(5));
        let service = service(config);
        service.initialize_note_completion("n1", "i1", None).await;

        let handle = CompletionSweeper::start(service.clone(), Arc::new(CompletionGuard::new()));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(service.tracker().is_empty());

        handle.shutdown().await.unwrap();
    }
}
