use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use mise_core::defaults::MIN_INSTRUCTION_LENGTH;
use mise_core::{InstructionLine, NoteStatus, Result, StatusEvent, WorkerType};

use super::{
    complete_worker, require_non_empty, stage_context, tracked_note, unexpected_payload, Action,
    ActionContext, ActionDeps, ActionName,
};
use crate::payload::{JobPayload, LineTracking};

/// Normalized instruction text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedInstruction {
    pub text: String,
    pub is_active: bool,
}

/// Normalize a raw instruction line.
///
/// Whitespace runs collapse to one space and the first letter is capitalized.
/// Lines shorter than [`MIN_INSTRUCTION_LENGTH`] are kept as-is but inactive;
/// everything else gets terminal punctuation.
pub fn format_instruction(raw: &str) -> FormattedInstruction {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() < MIN_INSTRUCTION_LENGTH {
        return FormattedInstruction {
            text: collapsed,
            is_active: false,
        };
    }

    let mut chars = collapsed.chars();
    let mut text = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => String::new(),
    };
    if !text.ends_with(['.', '!', '?']) {
        text.push('.');
    }

    FormattedInstruction {
        text,
        is_active: true,
    }
}

fn count_event(import_id: &str, note_id: &str, tracking: LineTracking) -> StatusEvent {
    StatusEvent::new(
        import_id,
        NoteStatus::Processing,
        stage_context(WorkerType::Instruction),
        format!(
            "Processing instructions {}/{}",
            tracking.current_index, tracking.total
        ),
    )
    .with_note(note_id)
    .with_indent(1)
    .with_metadata(json!({
        "current": tracking.current_index,
        "total": tracking.total,
    }))
}

fn validate_tracking(tracking: Option<LineTracking>) -> Result<LineTracking> {
    let tracking = tracking
        .ok_or_else(|| mise_core::Error::Validation("instruction tracking required".into()))?;
    if tracking.current_index > tracking.total {
        return Err(mise_core::Error::Validation(format!(
            "instruction index {} exceeds total {}",
            tracking.current_index, tracking.total
        )));
    }
    Ok(tracking)
}

/// Broadcasts "instruction i of n" progress.
pub struct UpdateInstructionCountAction;

#[async_trait]
impl Action for UpdateInstructionCountAction {
    fn name(&self) -> ActionName {
        ActionName::UpdateInstructionCount
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::InstructionLine(_) | JobPayload::InstructionCompletion(_) => {
                require_non_empty(data.import_id(), "importId")?;
                validate_tracking(data.tracking()).map(|_| ())
            }
            other => Err(unexpected_payload(self.name(), other)),
        }
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let tracking = validate_tracking(data.tracking())?;
        deps.broadcast(count_event(data.import_id(), data.note_id(), tracking))
            .await;
        Ok(data)
    }
}

/// Normalizes the instruction text and decides whether the line is active.
pub struct FormatInstructionAction;

#[async_trait]
impl Action for FormatInstructionAction {
    fn name(&self) -> ActionName {
        ActionName::FormatInstruction
    }

    fn retryable(&self) -> bool {
        false
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::InstructionLine(job) => require_non_empty(&job.note_id, "noteId"),
            other => Err(unexpected_payload(self.name(), other)),
        }
    }

    async fn execute(
        &self,
        data: JobPayload,
        _deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let mut job = match data {
            JobPayload::InstructionLine(job) => job,
            other => return Err(unexpected_payload(self.name(), &other)),
        };

        let formatted = format_instruction(&job.instruction_reference);
        if !formatted.is_active {
            debug!(
                note_id = %job.note_id,
                line_index = job.line_index,
                "Instruction line too short, marking inactive"
            );
        }
        job.instruction_reference = formatted.text;
        job.is_active = Some(formatted.is_active);
        Ok(JobPayload::InstructionLine(job))
    }
}

/// Stores the formatted instruction line.
pub struct SaveInstructionAction;

#[async_trait]
impl Action for SaveInstructionAction {
    fn name(&self) -> ActionName {
        ActionName::SaveInstruction
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::InstructionLine(job) => {
                require_non_empty(&job.note_id, "noteId")?;
                if job.is_active.is_none() {
                    return Err(mise_core::Error::Validation(
                        "instruction must be formatted before saving".into(),
                    ));
                }
                Ok(())
            }
            other => Err(unexpected_payload(self.name(), other)),
        }
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let mut job = match data {
            JobPayload::InstructionLine(job) => job,
            other => return Err(unexpected_payload(self.name(), &other)),
        };

        let id = deps
            .instructions
            .save_instruction_line(InstructionLine {
                note_id: job.note_id.clone(),
                line_index: job.line_index,
                reference: job.instruction_reference.clone(),
                is_active: job.is_active.unwrap_or(false),
            })
            .await?;
        job.instruction_line_id = Some(id);
        Ok(JobPayload::InstructionLine(job))
    }

    fn completion_message(&self, output: &JobPayload) -> Option<String> {
        match output {
            JobPayload::InstructionLine(job) => {
                Some(format!("Saved instruction {}", job.line_index + 1))
            }
            _ => None,
        }
    }
}

/// Completes the instruction worker once the last line has been handled.
///
/// The first check for a note broadcasts a completion line; retries only
/// re-mark the (idempotent) worker flag. Fails retryably until the note job
/// has started tracking the note.
pub struct CheckInstructionCompletionAction;

#[async_trait]
impl Action for CheckInstructionCompletionAction {
    fn name(&self) -> ActionName {
        ActionName::CheckInstructionCompletion
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::InstructionCompletion(job) => require_non_empty(&job.note_id, "noteId"),
            other => Err(unexpected_payload(self.name(), other)),
        }
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let note_id = data.note_id();
        if let Some(tracking) = data.tracking().filter(|t| !t.is_last()) {
            debug!(
                note_id,
                current = tracking.current_index,
                total = tracking.total,
                "Instructions still pending"
            );
            return Ok(data);
        }

        tracked_note(deps, note_id)?;
        complete_worker(
            deps,
            WorkerType::Instruction,
            data.import_id(),
            note_id,
            "All instructions processed".to_string(),
        )
        .await?;
        Ok(data)
    }
}
