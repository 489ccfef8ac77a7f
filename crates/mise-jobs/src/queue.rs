//! Job queue abstraction and in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use mise_core::{defaults, Error, Result, WorkerType};

use crate::payload::JobPayload;

/// A queued unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub worker_type: WorkerType,
    pub priority: i32,
    pub payload: JobPayload,
    /// Number of failed attempts so far.
    pub attempt: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    /// New job with the worker type's default priority.
    pub fn new(payload: JobPayload) -> Self {
        let worker_type = payload.worker_type();
        Self {
            id: Uuid::now_v7(),
            worker_type,
            priority: worker_type.default_priority(),
            payload,
            attempt: 0,
            max_retries: defaults::JOB_MAX_RETRIES,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued for another attempt.
    Retrying { attempt: u32 },
    /// Out of attempts, or the failure was permanent.
    Exhausted { attempts: u32 },
}

/// Storage for pending and running jobs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job, returning its id.
    async fn enqueue(&self, job: Job) -> Result<Uuid>;

    /// Claim the highest-priority pending job of one of the given types.
    async fn claim_next_for_types(&self, types: &[WorkerType]) -> Result<Option<Job>>;

    /// Record a successful job.
    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<()>;

    /// Record a failed job, re-queueing it when `retry` is set and attempts remain.
    async fn fail(&self, job_id: Uuid, error: &str, retry: bool) -> Result<FailOutcome>;

    async fn pending_count(&self) -> Result<usize>;

    /// Wait until new work may be available, or `timeout` elapses.
    async fn wait_for_work(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

/// A finished job kept for inspection.
#[derive(Debug, Clone)]
pub struct FinishedJob {
    pub job: Job,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

/// Totals of finished jobs, including those no longer in the history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Job>,
    running: HashMap<Uuid, Job>,
    /// Most recent finished jobs, oldest first. Bounded by `history_limit`.
    completed: VecDeque<FinishedJob>,
    failed: VecDeque<FinishedJob>,
    stats: QueueStats,
    /// Retries waiting out their backoff.
    scheduled: usize,
}

fn remember(history: &mut VecDeque<FinishedJob>, limit: usize, finished: FinishedJob) {
    if limit == 0 {
        return;
    }
    while history.len() >= limit {
        history.pop_front();
    }
    history.push_back(finished);
}

/// In-process job queue.
///
/// Ordering is by priority, then insertion order. Retries go back to the pending list after
/// `retry_backoff * attempt`. Only the last `history_limit` completed and failed jobs are
/// kept; [`QueueStats`] counts all of them.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    retry_backoff: Duration,
    history_limit: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            retry_backoff: Duration::from_secs(1),
            history_limit: defaults::JOB_HISTORY_LIMIT,
        }
    }

    /// Queue with `JOB_HISTORY_LIMIT` read from the environment.
    pub fn from_env() -> Self {
        let history_limit = std::env::var("JOB_HISTORY_LIMIT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_HISTORY_LIMIT);
        Self::new().with_history_limit(history_limit)
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Keep at most `limit` completed and `limit` failed jobs. Zero keeps none.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Convenience wrapper building a [`Job`] with `JOB_MAX_RETRIES` from the
    /// environment.
    pub async fn push(&self, payload: JobPayload) -> Result<Uuid> {
        let max_retries = std::env::var("JOB_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::JOB_MAX_RETRIES);
        self.enqueue(Job::new(payload).with_max_retries(max_retries))
            .await
    }

    /// Recently completed jobs, oldest first.
    pub async fn completed(&self) -> Vec<FinishedJob> {
        self.state.lock().await.completed.iter().cloned().collect()
    }

    /// Recently failed jobs, oldest first.
    pub async fn failed(&self) -> Vec<FinishedJob> {
        self.state.lock().await.failed.iter().cloned().collect()
    }

    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// True when nothing is pending, running or waiting to be retried.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.pending.is_empty() && state.running.is_empty() && state.scheduled == 0
    }

    async fn requeue(&self, mut job: Job) {
        job.started_at = None;
        let mut state = self.state.lock().await;
        state.scheduled = state.scheduled.saturating_sub(1);
        state.pending.push(job);
        drop(state);
        self.notify.notify_one();
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<Uuid> {
        let id = job.id;
        debug!(job_id = %id, worker_type = %job.worker_type, kind = job.payload.kind(), "Job queued");
        self.state.lock().await.pending.push(job);
        self.notify.notify_one();
        Ok(id)
    }

    async fn claim_next_for_types(&self, types: &[WorkerType]) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let mut best: Option<(usize, i32)> = None;
        for (index, job) in state.pending.iter().enumerate() {
            if !types.contains(&job.worker_type) {
                continue;
            }
            if best.map_or(true, |(_, priority)| job.priority > priority) {
                best = Some((index, job.priority));
            }
        }

        let Some((index, _)) = best else {
            return Ok(None);
        };
        let mut job = state.pending.remove(index);
        job.started_at = Some(Utc::now());
        state.running.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .running
            .remove(&job_id)
            .ok_or_else(|| Error::NotFound(format!("running job {job_id}")))?;
        state.stats.completed += 1;
        remember(
            &mut state.completed,
            self.history_limit,
            FinishedJob {
                job,
                result,
                error: None,
            },
        );
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, retry: bool) -> Result<FailOutcome> {
        let mut state = self.state.lock().await;
        let mut job = state
            .running
            .remove(&job_id)
            .ok_or_else(|| Error::NotFound(format!("running job {job_id}")))?;
        job.attempt += 1;

        if !retry || job.attempt > job.max_retries {
            let attempts = job.attempt;
            state.stats.failed += 1;
            remember(
                &mut state.failed,
                self.history_limit,
                FinishedJob {
                    job,
                    result: None,
                    error: Some(error.to_string()),
                },
            );
            return Ok(FailOutcome::Exhausted { attempts });
        }

        let attempt = job.attempt;
        let delay = self.retry_backoff * attempt;
        if delay.is_zero() {
            job.started_at = None;
            state.pending.push(job);
            drop(state);
            self.notify.notify_one();
        } else {
            state.scheduled += 1;
            drop(state);
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.requeue(job).await;
            });
        }
        warn!(%job_id, attempt, delay_ms = delay.as_millis() as u64, "Job scheduled for retry");
        Ok(FailOutcome::Retrying { attempt })
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.state.lock().await.pending.len())
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
