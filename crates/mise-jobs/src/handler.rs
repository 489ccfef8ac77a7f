//! Job handlers for each worker type.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use mise_core::WorkerType;

use crate::action::{ActionContext, ActionDeps, ActionFactory};
use crate::payload::JobPayload;
use crate::queue::Job;

/// Progress callback type for job handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress to the callback.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }

    pub fn note_id(&self) -> &str {
        self.job.payload.note_id()
    }

    pub fn payload(&self) -> &JobPayload {
        &self.job.payload
    }
}

/// Result of job execution.
#[derive(Debug)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<serde_json::Value>),
    /// Job failed permanently.
    Failed(String),
    /// Job should be retried.
    Retry(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The worker type this handler processes.
    fn worker_type(&self) -> WorkerType;

    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// Runs the action pipeline selected for each job of one worker type.
pub struct PipelineHandler {
    worker_type: WorkerType,
    factory: Arc<ActionFactory>,
    deps: ActionDeps,
}

impl PipelineHandler {
    pub fn new(worker_type: WorkerType, factory: Arc<ActionFactory>, deps: ActionDeps) -> Self {
        Self {
            worker_type,
            factory,
            deps,
        }
    }

    /// One handler per worker type, sharing the factory and collaborators.
    pub fn for_all(factory: Arc<ActionFactory>, deps: ActionDeps) -> Vec<Self> {
        WorkerType::ALL
            .into_iter()
            .map(|worker_type| Self::new(worker_type, factory.clone(), deps.clone()))
            .collect()
    }
}

#[async_trait]
impl JobHandler for PipelineHandler {
    fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload = ctx.job.payload.clone();
        if payload.worker_type() != self.worker_type {
            return JobResult::Failed(format!(
                "{} handler cannot run {} jobs",
                self.worker_type,
                payload.kind()
            ));
        }

        let pipeline = match self.factory.build_pipeline(&payload) {
            Ok(pipeline) => pipeline,
            Err(e) => return JobResult::Failed(e.to_string()),
        };
        debug!(
            job_id = %ctx.job.id,
            kind = payload.kind(),
            actions = ?pipeline.names(),
            "Pipeline selected"
        );

        ctx.report_progress(0, Some("Running pipeline"));
        let action_ctx = ActionContext::new(ctx.job.id, ctx.job.attempt, self.worker_type);

        match pipeline.run(payload, &self.deps, &action_ctx).await {
            Ok(output) => {
                ctx.report_progress(100, Some("Done"));
                match serde_json::to_value(&output) {
                    Ok(value) => JobResult::Success(Some(value)),
                    Err(e) => {
                        warn!(job_id = %ctx.job.id, error = %e, "Failed to serialize job result");
                        JobResult::Success(None)
                    }
                }
            }
            Err(failure) if failure.retryable => JobResult::Retry(failure.to_string()),
            Err(failure) => JobResult::Failed(failure.to_string()),
        }
    }
}
