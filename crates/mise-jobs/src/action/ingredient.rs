use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use mise_core::{IngredientLine, NoteStatus, Result, StatusEvent, WorkerType};

use super::{
    complete_worker, not_tracked, require_non_empty, stage_context, totals_pending, tracked_note,
    unexpected_payload, Action, ActionContext, ActionDeps, ActionName,
};
use crate::payload::JobPayload;

/// Broadcasts "ingredient i of n" progress.
pub struct UpdateIngredientCountAction;

#[async_trait]
impl Action for UpdateIngredientCountAction {
    fn name(&self) -> ActionName {
        ActionName::UpdateIngredientCount
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::IngredientLine(_) | JobPayload::IngredientCompletion(_) => {
                require_non_empty(data.import_id(), "importId")?;
                match data.tracking() {
                    Some(t) if t.current_index <= t.total => Ok(()),
                    Some(t) => Err(mise_core::Error::Validation(format!(
                        "ingredient index {} exceeds total {}",
                        t.current_index, t.total
                    ))),
                    None => Err(mise_core::Error::Validation(
                        "ingredient tracking required".into(),
                    )),
                }
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
        if let Some(tracking) = data.tracking() {
            let event = StatusEvent::new(
                data.import_id(),
                NoteStatus::Processing,
                stage_context(WorkerType::Ingredient),
                format!(
                    "Processing ingredients {}/{}",
                    tracking.current_index, tracking.total
                ),
            )
            .with_note(data.note_id())
            .with_indent(1)
            .with_metadata(json!({
                "current": tracking.current_index,
                "total": tracking.total,
            }));
            deps.broadcast(event).await;
        }
        Ok(data)
    }
}

/// Stores the parsed ingredient line.
pub struct SaveIngredientLineAction;

#[async_trait]
impl Action for SaveIngredientLineAction {
    fn name(&self) -> ActionName {
        ActionName::SaveIngredientLine
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::IngredientLine(job) => {
                require_non_empty(&job.note_id, "noteId")?;
                require_non_empty(&job.reference, "reference")
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
            JobPayload::IngredientLine(job) => job,
            other => return Err(unexpected_payload(self.name(), &other)),
        };

        let id = deps
            .ingredients
            .save_ingredient_line(IngredientLine {
                note_id: job.note_id.clone(),
                block_index: job.block_index,
                line_index: job.line_index,
                reference: job.reference.trim().to_string(),
                parsed: job.parsed.clone(),
            })
            .await?;
        job.ingredient_line_id = Some(id);
        Ok(JobPayload::IngredientLine(job))
    }
}

/// Records the stored line with completion tracking.
pub struct TrackIngredientLineAction;

#[async_trait]
impl Action for TrackIngredientLineAction {
    fn name(&self) -> ActionName {
        ActionName::TrackIngredientLine
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::IngredientLine(job) => require_non_empty(&job.note_id, "noteId"),
            other => Err(unexpected_payload(self.name(), other)),
        }
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        if let JobPayload::IngredientLine(job) = &data {
            if !tracked_note(deps, &job.note_id)?.ingredient_total_set {
                return Err(totals_pending(&job.note_id));
            }
            deps.completion
                .mark_ingredient_line_completed(&job.note_id, job.block_index, job.line_index)
                .ok_or_else(|| not_tracked(&job.note_id))?;
        }
        Ok(data)
    }
}

/// Completes the ingredient worker once every expected line is stored.
///
/// Lines are stored concurrently, so the check consults the tracked line set
/// rather than the job order. While lines are still missing it fails with a
/// retryable error and lets the queue try again later.
pub struct CheckIngredientCompletionAction;

#[async_trait]
impl Action for CheckIngredientCompletionAction {
    fn name(&self) -> ActionName {
        ActionName::CheckIngredientCompletion
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        match data {
            JobPayload::IngredientCompletion(job) => require_non_empty(&job.note_id, "noteId"),
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
        if data.tracking().is_some_and(|t| !t.is_last()) {
            debug!(note_id, "Ingredient lines still being dispatched");
            return Ok(data);
        }

        let note = tracked_note(deps, note_id)?;
        if !note.ingredient_total_set {
            return Err(totals_pending(note_id));
        }
        let progress = note.ingredient_progress();
        if progress.total > 0 && !progress.is_complete {
            return Err(mise_core::Error::Job(format!(
                "ingredient lines still pending for note {note_id}: {}",
                progress.label()
            )));
        }

        complete_worker(
            deps,
            WorkerType::Ingredient,
            data.import_id(),
            note_id,
            format!("All ingredients processed ({})", progress.label()),
        )
        .await?;
        Ok(data)
    }
}
