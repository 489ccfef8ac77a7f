//! Actions and pipelines.
//!
//! An [`Action`] is one named step of a job: it validates its input, does its
//! work, and hands a (possibly changed) payload to the next step. A
//! [`Pipeline`] runs the actions selected for a payload strictly in order and
//! stops at the first failure.

mod factory;
mod image;
mod ingredient;
mod instruction;
mod note;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use mise_core::{
    ImageStore, IngredientRepository, InstructionRepository, NoteStatus, Result,
    StatusBroadcaster, StatusEvent, WorkerType,
};

use crate::completion::{CompletionGuard, CompletionService, MarkOutcome, NoteCompletionStatus};
use crate::payload::JobPayload;

pub use factory::{pipeline_plan, ActionFactory};
pub use image::{TrackImageCompletionAction, UploadImageAction};
pub use ingredient::{
    CheckIngredientCompletionAction, SaveIngredientLineAction, TrackIngredientLineAction,
    UpdateIngredientCountAction,
};
pub use instruction::{
    format_instruction, CheckInstructionCompletionAction, FormatInstructionAction,
    FormattedInstruction, SaveInstructionAction, UpdateInstructionCountAction,
};
pub use note::{CompleteNoteWorkerAction, InitializeNoteCompletionAction, RegisterNoteTotalsAction};

/// Identifier of every built-in action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionName {
    InitializeNoteCompletion,
    RegisterNoteTotals,
    CompleteNoteWorker,
    UpdateInstructionCount,
    FormatInstruction,
    SaveInstruction,
    CheckInstructionCompletion,
    UpdateIngredientCount,
    SaveIngredientLine,
    TrackIngredientLine,
    CheckIngredientCompletion,
    UploadImage,
    TrackImageCompletion,
}

impl ActionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionName::InitializeNoteCompletion => "initialize_note_completion",
            ActionName::RegisterNoteTotals => "register_note_totals",
            ActionName::CompleteNoteWorker => "complete_note_worker",
            ActionName::UpdateInstructionCount => "update_instruction_count",
            ActionName::FormatInstruction => "format_instruction",
            ActionName::SaveInstruction => "save_instruction",
            ActionName::CheckInstructionCompletion => "check_instruction_completion",
            ActionName::UpdateIngredientCount => "update_ingredient_count",
            ActionName::SaveIngredientLine => "save_ingredient_line",
            ActionName::TrackIngredientLine => "track_ingredient_line",
            ActionName::CheckIngredientCompletion => "check_ingredient_completion",
            ActionName::UploadImage => "upload_image",
            ActionName::TrackImageCompletion => "track_image_completion",
        }
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job execution context handed to every action.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub job_id: Uuid,
    /// 0 on the first run, incremented on each retry.
    pub attempt: u32,
    pub worker_type: WorkerType,
}

impl ActionContext {
    pub fn new(job_id: Uuid, attempt: u32, worker_type: WorkerType) -> Self {
        Self {
            job_id,
            attempt,
            worker_type,
        }
    }
}

/// Collaborators available to actions.
#[derive(Clone)]
pub struct ActionDeps {
    pub completion: Arc<CompletionService>,
    pub guard: Arc<CompletionGuard>,
    pub broadcaster: Arc<dyn StatusBroadcaster>,
    pub instructions: Arc<dyn InstructionRepository>,
    pub ingredients: Arc<dyn IngredientRepository>,
    pub images: Arc<dyn ImageStore>,
}

impl ActionDeps {
    /// Broadcast a status event, logging instead of failing.
    pub async fn broadcast(&self, event: StatusEvent) {
        if let Err(e) = self.broadcaster.broadcast(event).await {
            warn!(error = %e, "Status broadcast failed");
        }
    }
}

/// Status event context for a worker's progress lines.
pub fn stage_context(worker: WorkerType) -> &'static str {
    match worker {
        WorkerType::Note => "note_processing",
        WorkerType::Instruction => "instruction_processing",
        WorkerType::Ingredient => "ingredient_processing",
        WorkerType::Image => "image_upload",
    }
}

/// One named pipeline step.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> ActionName;

    /// Whether a failure of this action may succeed on retry.
    fn retryable(&self) -> bool {
        true
    }

    /// Actions that broadcast their own status return `true` to skip the
    /// pipeline's start/finish broadcasts.
    fn suppress_default_broadcast(&self) -> bool {
        false
    }

    /// Synchronous precondition check. Runs before [`Action::execute`].
    fn validate_input(&self, data: &JobPayload) -> Result<()>;

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        ctx: &ActionContext,
    ) -> Result<JobPayload>;

    /// Message broadcast before `execute`.
    fn start_message(&self, _data: &JobPayload) -> Option<String> {
        None
    }

    /// Message broadcast after a successful `execute`.
    fn completion_message(&self, _output: &JobPayload) -> Option<String> {
        None
    }
}

/// A pipeline failure: the action that failed and its unmodified error.
#[derive(Debug, Error)]
#[error("{action} failed: {source}")]
pub struct PipelineFailure {
    pub action: ActionName,
    /// False for validation errors and non-retryable actions.
    pub retryable: bool,
    #[source]
    pub source: mise_core::Error,
}

/// Ordered list of actions for one job.
#[derive(Clone, Default)]
pub struct Pipeline {
    actions: Vec<Arc<dyn Action>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("actions", &self.names())
            .finish()
    }
}

impl Pipeline {
    pub fn new(actions: Vec<Arc<dyn Action>>) -> Self {
        Self { actions }
    }

    pub fn names(&self) -> Vec<ActionName> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action in order, feeding each output to the next action.
    pub async fn run(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        ctx: &ActionContext,
    ) -> std::result::Result<JobPayload, PipelineFailure> {
        let mut data = data;
        for action in &self.actions {
            data = run_action(action.as_ref(), data, deps, ctx).await?;
        }
        Ok(data)
    }
}

async fn run_action(
    action: &dyn Action,
    data: JobPayload,
    deps: &ActionDeps,
    ctx: &ActionContext,
) -> std::result::Result<JobPayload, PipelineFailure> {
    let name = action.name();
    let note_id = data.note_id().to_string();
    let import_id = data.import_id().to_string();

    if let Err(e) = action.validate_input(&data) {
        warn!(action = %name, %note_id, job_id = %ctx.job_id, error = %e, "Action input rejected");
        return Err(PipelineFailure {
            action: name,
            retryable: false,
            source: e,
        });
    }

    let broadcasts = !action.suppress_default_broadcast();
    if broadcasts {
        if let Some(message) = action.start_message(&data) {
            deps.broadcast(progress_event(&import_id, &note_id, ctx.worker_type, message))
                .await;
        }
    }

    let start = Instant::now();
    match action.execute(data, deps, ctx).await {
        Ok(output) => {
            debug!(
                action = %name,
                %note_id,
                job_id = %ctx.job_id,
                duration_ms = start.elapsed().as_millis() as u64,
                "Action completed"
            );
            if broadcasts {
                if let Some(message) = action.completion_message(&output) {
                    deps.broadcast(progress_event(&import_id, &note_id, ctx.worker_type, message))
                        .await;
                }
            }
            Ok(output)
        }
        Err(e) => {
            warn!(
                action = %name,
                %note_id,
                job_id = %ctx.job_id,
                attempt = ctx.attempt,
                duration_ms = start.elapsed().as_millis() as u64,
                error = %e,
                "Action failed"
            );
            Err(PipelineFailure {
                action: name,
                retryable: action.retryable() && e.is_retryable(),
                source: e,
            })
        }
    }
}

fn progress_event(
    import_id: &str,
    note_id: &str,
    worker: WorkerType,
    message: String,
) -> StatusEvent {
    StatusEvent::new(import_id, NoteStatus::Processing, stage_context(worker), message)
        .with_note(note_id)
        .with_indent(1)
}

/// Reject empty identifiers with a validation error.
pub(crate) fn require_non_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(mise_core::Error::Validation(format!("{field} required")));
    }
    Ok(())
}

/// Validation error for a payload of the wrong kind.
pub(crate) fn unexpected_payload(action: ActionName, data: &JobPayload) -> mise_core::Error {
    mise_core::Error::Validation(format!("{action} cannot handle {} jobs", data.kind()))
}

/// The note's completion record.
///
/// Fan-out jobs can run before their note job has created the record, so a
/// missing record is a retryable error.
pub(crate) fn tracked_note(deps: &ActionDeps, note_id: &str) -> Result<NoteCompletionStatus> {
    deps.completion
        .get_note_completion_status(note_id)
        .ok_or_else(|| not_tracked(note_id))
}

pub(crate) fn not_tracked(note_id: &str) -> mise_core::Error {
    mise_core::Error::Job(format!("note {note_id} is not tracked yet"))
}

pub(crate) fn totals_pending(note_id: &str) -> mise_core::Error {
    mise_core::Error::Job(format!("totals for note {note_id} are not registered yet"))
}

/// Broadcast a worker's completion line once per note, then mark the worker.
///
/// If the record vanished in between, the claim is given back and the job
/// fails retryably.
pub(crate) async fn complete_worker(
    deps: &ActionDeps,
    worker: WorkerType,
    import_id: &str,
    note_id: &str,
    message: String,
) -> Result<()> {
    let claimed = deps.guard.claim(worker, note_id);
    if claimed {
        let event = StatusEvent::new(import_id, NoteStatus::Completed, stage_context(worker), message)
            .with_note(note_id)
            .with_indent(1);
        deps.broadcast(event).await;
    } else {
        debug!(note_id, %worker, "Worker completion already broadcast");
    }

    let outcome = deps.completion.mark_worker_completed(note_id, worker).await;
    if matches!(outcome, MarkOutcome::Unknown) {
        if claimed {
            deps.guard.release(worker, note_id);
        }
        return Err(not_tracked(note_id));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::memory::{
        MemoryImageStore, MemoryNoteStore, RecordingBroadcaster, RecordingCleanup,
    };

    pub struct Harness {
        pub deps: ActionDeps,
        pub notes: Arc<MemoryNoteStore>,
        pub broadcaster: Arc<RecordingBroadcaster>,
        pub cleanup: Arc<RecordingCleanup>,
        pub images: Arc<MemoryImageStore>,
    }

    pub fn harness() -> Harness {
        let notes = Arc::new(MemoryNoteStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let cleanup = Arc::new(RecordingCleanup::new());
        let images = Arc::new(MemoryImageStore::new());
        let completion = Arc::new(CompletionService::new(
            notes.clone(),
            broadcaster.clone(),
            cleanup.clone(),
        ));
        let deps = ActionDeps {
            completion,
            guard: Arc::new(CompletionGuard::new()),
            broadcaster: broadcaster.clone(),
            instructions: notes.clone(),
            ingredients: notes.clone(),
            images: images.clone(),
        };
        Harness {
            deps,
            notes,
            broadcaster,
            cleanup,
            images,
        }
    }

    pub fn ctx(worker_type: WorkerType) -> ActionContext {
        ActionContext::new(Uuid::new_v4(), 0, worker_type)
    }
}
