//! mise-worker: runs the recipe import job workers in one process.
//!
//! Jobs are read from the JSON file named by `MISE_JOBS_FILE` (an array of
//! job payloads) at startup. Status events are logged as they are emitted.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use mise_core::{init_tracing, EventBus, EventEnvelope, LoggingConfig};
use mise_jobs::action::{ActionDeps, ActionFactory};
use mise_jobs::cleanup::DirectoryCleanup;
use mise_jobs::completion::{CompletionConfig, CompletionGuard, CompletionService, CompletionSweeper};
use mise_jobs::handler::PipelineHandler;
use mise_jobs::memory::{MemoryImageStore, MemoryNoteStore};
use mise_jobs::payload::JobPayload;
use mise_jobs::queue::MemoryQueue;
use mise_jobs::worker::{WorkerBuilder, WorkerConfig, WorkerEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let logging = LoggingConfig::from_env();
    let _file_guard = init_tracing(&logging)?;
    info!(
        log_format = ?logging.format,
        log_file = logging.file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    // Collaborators
    let event_bus = Arc::new(EventBus::default());
    let notes = Arc::new(MemoryNoteStore::new());
    let images = Arc::new(MemoryImageStore::new());
    let cleanup = Arc::new(DirectoryCleanup::from_env());
    info!(work_dir = %cleanup.root().display(), "Import working directory");

    let completion_config = CompletionConfig::from_env();
    info!(
        stale_ttl_secs = completion_config.stale_ttl.as_secs(),
        retention_secs = completion_config.retention.as_secs(),
        sweep_interval_secs = completion_config.sweep_interval.as_secs(),
        "Completion tracking configured"
    );
    let completion = Arc::new(
        CompletionService::new(notes.clone(), event_bus.clone(), cleanup)
            .with_config(completion_config),
    );
    let guard = Arc::new(CompletionGuard::new());

    let deps = ActionDeps {
        completion: completion.clone(),
        guard: guard.clone(),
        broadcaster: event_bus.clone(),
        instructions: notes.clone(),
        ingredients: notes,
        images,
    };

    tokio::spawn(log_status_events(event_bus.subscribe()));

    // Create and start job worker
    let queue = MemoryQueue::from_env();
    let factory = Arc::new(ActionFactory::with_defaults());
    let mut builder = WorkerBuilder::new(Arc::new(queue.clone()))
        .with_config(WorkerConfig::from_env())
        .with_completion(completion.clone());
    for handler in PipelineHandler::for_all(factory, deps) {
        builder = builder.with_handler(handler);
    }
    let handle = builder.build().await.start();
    info!("Job worker started");

    tokio::spawn(log_worker_events(handle.events()));

    let sweeper = CompletionSweeper::start(completion, guard);

    if let Ok(path) = std::env::var("MISE_JOBS_FILE") {
        let jobs = load_jobs(Path::new(&path)).await?;
        let count = jobs.len();
        for payload in jobs {
            queue.push(payload).await?;
        }
        info!(count, path = %path, "Queued jobs from file");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received");

    handle.shutdown().await?;
    sweeper.shutdown().await?;

    let idle = queue.is_idle().await;
    let stats = queue.stats().await;
    info!(
        idle,
        completed = stats.completed,
        failed = stats.failed,
        "mise-worker stopped"
    );
    Ok(())
}

/// Read a JSON array of job payloads.
async fn load_jobs(path: &Path) -> anyhow::Result<Vec<JobPayload>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read jobs file {}", path.display()))?;
    let jobs: Vec<JobPayload> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid jobs file {}", path.display()))?;
    Ok(jobs)
}

async fn log_status_events(mut rx: broadcast::Receiver<EventEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let payload = &envelope.payload;
                info!(
                    event_type = %envelope.event_type,
                    import_id = %envelope.import_id,
                    note_id = payload.note_id.as_deref().unwrap_or("-"),
                    context = %payload.context,
                    "{}",
                    payload.message
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Status event logger lagged, missed events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_worker_events(mut rx: broadcast::Receiver<WorkerEvent>) {
    loop {
        match rx.recv().await {
            Ok(WorkerEvent::JobRetrying {
                job_id,
                worker_type,
                attempt,
                error,
            }) => warn!(%job_id, %worker_type, attempt, %error, "Job will be retried"),
            Ok(WorkerEvent::JobFailed {
                job_id,
                worker_type,
                error,
            }) => warn!(%job_id, %worker_type, %error, "Job failed permanently"),
            Ok(WorkerEvent::WorkerStopped) => {
                info!("Worker event channel finished");
                break;
            }
            Ok(event) => debug!(?event, "Worker event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Worker event logger lagged, missed events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_jobs_reads_tagged_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(
            &path,
            r#"[
                {"kind": "note", "note_id": "n1", "import_id": "i1", "total_image_jobs": 1},
                {"kind": "instruction_line", "note_id": "n1", "import_id": "i1",
                 "line_index": 0, "instruction_reference": "mix"},
                {"kind": "image", "note_id": "n1", "import_id": "i1", "image_path": "a.jpg"}
            ]"#,
        )
        .unwrap();

        let jobs = load_jobs(&path).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].kind(), "note");
        assert_eq!(jobs[1].kind(), "instruction_line");
        assert_eq!(jobs[2].note_id(), "n1");
    }

    #[tokio::test]
    async fn test_load_jobs_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_jobs(&dir.path().join("missing.json")).await;
        assert!(missing.unwrap_err().to_string().contains("failed to read"));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"[{"kind": "recipe"}]"#).unwrap();
        let bad = load_jobs(&path).await;
        assert!(bad.unwrap_err().to_string().contains("invalid jobs file"));
    }
}
