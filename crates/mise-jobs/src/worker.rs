//! Job worker and runner for processing import jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use mise_core::{defaults, ImportErrorCode, Result, WorkerType};

use crate::completion::CompletionService;
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::queue::{FailOutcome, Job, JobQueue};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Per-job timeout in seconds.
    pub job_timeout_secs: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job timeout |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let job_timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_TIMEOUT_SECS)
            .max(1);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            job_timeout_secs,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    JobStarted {
        job_id: Uuid,
        worker_type: WorkerType,
    },
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    JobCompleted {
        job_id: Uuid,
        worker_type: WorkerType,
    },
    /// The job was re-queued after a transient failure.
    JobRetrying {
        job_id: Uuid,
        worker_type: WorkerType,
        attempt: u32,
        error: String,
    },
    /// The job failed for good.
    JobFailed {
        job_id: Uuid,
        worker_type: WorkerType,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| mise_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

type HandlerMap = Arc<RwLock<HashMap<WorkerType, Arc<dyn JobHandler>>>>;

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    completion: Option<Arc<CompletionService>>,
}

impl JobWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
        completion: Option<Arc<CompletionService>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            queue,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            completion,
        }
    }

    /// Register a handler for a worker type.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        let worker_type = handler.worker_type();
        let mut handlers = self.handlers.write().await;
        handlers.insert(worker_type, Arc::new(handler));
        debug!(%worker_type, "Registered job handler");
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        tokio::spawn(async move {
            worker.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Run the worker loop.
    ///
    /// Claims up to `max_concurrent_jobs` at a time and processes them
    /// concurrently. Only waits when the queue is empty.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            job_timeout_secs = self.config.job_timeout_secs,
            "Job worker started"
        );

        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_concurrent = self.config.max_concurrent_jobs;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..max_concurrent {
                match self.claim_job().await {
                    Some(job) => {
                        claimed += 1;
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_job(job).await;
                        });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = self.queue.wait_for_work(poll_interval) => {}
                }
            } else {
                debug!(claimed, "Processing concurrent job batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Job task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    async fn claim_job(&self) -> Option<Job> {
        let worker_types: Vec<WorkerType> = {
            let handlers = self.handlers.read().await;
            handlers.keys().copied().collect()
        };

        match self.queue.claim_next_for_types(&worker_types).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = ?e, "Failed to claim job");
                None
            }
        }
    }

    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            completion: self.completion.clone(),
            job_timeout: Duration::from_secs(self.config.job_timeout_secs),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.queue.pending_count().await
    }
}

/// Reference bundle for executing a single job in a spawned task.
struct JobWorkerRef {
    queue: Arc<dyn JobQueue>,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    completion: Option<Arc<CompletionService>>,
    job_timeout: Duration,
}

impl JobWorkerRef {
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let worker_type = job.worker_type;
        let note_id = job.payload.note_id().to_string();
        let kind = job.payload.kind();
        let attempt = job.attempt;

        info!(%job_id, %worker_type, kind, %note_id, attempt, "Processing job");

        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            worker_type,
        });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&worker_type).cloned()
        };

        let mut error_code = ImportErrorCode::for_worker(worker_type);
        let result = match handler {
            Some(handler) => {
                let event_tx = self.event_tx.clone();
                let ctx = JobContext::new(job).with_progress_callback(move |percent, message| {
                    let _ = event_tx.send(WorkerEvent::JobProgress {
                        job_id,
                        percent,
                        message: message.map(String::from),
                    });
                });

                match tokio::time::timeout(self.job_timeout, handler.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let secs = self.job_timeout.as_secs();
                        warn!(%job_id, %worker_type, "Job exceeded timeout of {secs}s");
                        error_code = ImportErrorCode::QueueJobFailed;
                        JobResult::Failed(format!("Job exceeded timeout of {secs}s"))
                    }
                }
            }
            None => {
                warn!(%worker_type, "No handler registered for worker type");
                error_code = ImportErrorCode::QueueJobFailed;
                JobResult::Failed(format!("No handler for worker type: {worker_type}"))
            }
        };

        match result {
            JobResult::Success(result_data) => {
                if let Err(e) = self.queue.complete(job_id, result_data).await {
                    error!(error = ?e, %job_id, "Failed to mark job as completed");
                } else {
                    info!(
                        %job_id,
                        %worker_type,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job completed successfully"
                    );
                    let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                        job_id,
                        worker_type,
                    });
                }
            }
            JobResult::Failed(error) => {
                self.fail(job_id, worker_type, &note_id, error, false, error_code, start)
                    .await
            }
            JobResult::Retry(error) => {
                self.fail(job_id, worker_type, &note_id, error, true, error_code, start)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        job_id: Uuid,
        worker_type: WorkerType,
        note_id: &str,
        error: String,
        retry: bool,
        error_code: ImportErrorCode,
        start: Instant,
    ) {
        let outcome = match self.queue.fail(job_id, &error, retry).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = ?e, %job_id, "Failed to mark job as failed");
                return;
            }
        };

        match outcome {
            FailOutcome::Retrying { attempt } => {
                warn!(
                    %job_id,
                    %worker_type,
                    attempt,
                    %error,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job failed, retrying"
                );
                let _ = self.event_tx.send(WorkerEvent::JobRetrying {
                    job_id,
                    worker_type,
                    attempt,
                    error,
                });
            }
            FailOutcome::Exhausted { attempts } => {
                warn!(
                    %job_id,
                    %worker_type,
                    attempts,
                    %error,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job failed"
                );
                if let Some(completion) = &self.completion {
                    let details = json!({
                        "job_id": job_id,
                        "worker_type": worker_type,
                        "attempts": attempts,
                    });
                    completion
                        .mark_note_as_failed(note_id, &error, Some(error_code), Some(details))
                        .await;
                }
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    worker_type,
                    error,
                });
            }
        }
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    handlers: Vec<Box<dyn JobHandler>>,
    completion: Option<Arc<CompletionService>>,
}

impl WorkerBuilder {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
            completion: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Notes whose jobs fail for good are marked failed through this service.
    pub fn with_completion(mut self, completion: Arc<CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub async fn build(self) -> JobWorker {
        let worker = JobWorker::new(self.queue, self.config, self.completion);

        for handler in self.handlers {
            let worker_type = handler.worker_type();
            let mut handlers = worker.handlers.write().await;
            handlers.insert(worker_type, Arc::from(handler));
        }

        worker
    }
}
