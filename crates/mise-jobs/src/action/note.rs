use async_trait::async_trait;
use tracing::debug;

use mise_core::{Result, WorkerType};

use super::{require_non_empty, unexpected_payload, Action, ActionContext, ActionDeps, ActionName};
use crate::payload::{JobPayload, NoteJob};

fn note_job<'a>(action: ActionName, data: &'a JobPayload) -> Result<&'a NoteJob> {
    match data {
        JobPayload::Note(job) => Ok(job),
        other => Err(unexpected_payload(action, other)),
    }
}

/// Starts completion tracking for the note.
pub struct InitializeNoteCompletionAction;

#[async_trait]
impl Action for InitializeNoteCompletionAction {
    fn name(&self) -> ActionName {
        ActionName::InitializeNoteCompletion
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        let job = note_job(self.name(), data)?;
        require_non_empty(&job.note_id, "noteId")?;
        require_non_empty(&job.import_id, "importId")
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let job = note_job(self.name(), &data)?;
        deps.completion
            .initialize_note_completion(&job.note_id, &job.import_id, job.html_file_name.as_deref())
            .await;
        Ok(data)
    }

    fn start_message(&self, data: &JobPayload) -> Option<String> {
        match data {
            JobPayload::Note(NoteJob {
                html_file_name: Some(name),
                ..
            }) => Some(format!("Importing {name}")),
            _ => Some("Importing note".to_string()),
        }
    }
}

/// Registers the expected line and image counts.
///
/// A category with nothing to do is completed right away, since no job of
/// that kind will ever report in.
pub struct RegisterNoteTotalsAction;

#[async_trait]
impl Action for RegisterNoteTotalsAction {
    fn name(&self) -> ActionName {
        ActionName::RegisterNoteTotals
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        let job = note_job(self.name(), data)?;
        require_non_empty(&job.note_id, "noteId")
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        let job = note_job(self.name(), &data)?;
        let note_id = job.note_id.as_str();

        deps.completion
            .set_total_image_jobs(note_id, job.total_image_jobs);
        deps.completion
            .set_total_ingredient_lines(note_id, job.total_ingredient_lines);

        let empty = [
            (WorkerType::Instruction, job.total_instructions),
            (WorkerType::Ingredient, job.total_ingredient_lines),
            (WorkerType::Image, job.total_image_jobs),
        ];
        for (worker, _) in empty.into_iter().filter(|(_, total)| *total == 0) {
            debug!(note_id, %worker, "Nothing to process, completing worker");
            deps.completion.mark_worker_completed(note_id, worker).await;
        }

        Ok(data)
    }
}

/// Marks the note worker itself as done.
pub struct CompleteNoteWorkerAction;

#[async_trait]
impl Action for CompleteNoteWorkerAction {
    fn name(&self) -> ActionName {
        ActionName::CompleteNoteWorker
    }

    fn suppress_default_broadcast(&self) -> bool {
        true
    }

    fn validate_input(&self, data: &JobPayload) -> Result<()> {
        let job = note_job(self.name(), data)?;
        require_non_empty(&job.note_id, "noteId")
    }

    async fn execute(
        &self,
        data: JobPayload,
        deps: &ActionDeps,
        _ctx: &ActionContext,
    ) -> Result<JobPayload> {
        deps.completion
            .mark_worker_completed(data.note_id(), WorkerType::Note)
            .await;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{ctx, harness};
    use super::*;
    use mise_core::NoteStatus;

    fn note(instructions: u32, ingredients: u32, images: u32) -> JobPayload {
        JobPayload::Note(NoteJob {
            note_id: "n1".into(),
            import_id: "i1".into(),
            html_file_name: Some("pancakes.html".into()),
            total_instructions: instructions,
            total_ingredient_lines: ingredients,
            total_image_jobs: images,
        })
    }

    #[tokio::test]
    async fn test_initialize_marks_processing() {
        let h = harness();
        InitializeNoteCompletionAction
            .execute(note(1, 1, 1), &h.deps, &ctx(WorkerType::Note))
            .await
            .unwrap();

        let status = h.deps.completion.get_note_completion_status("n1").unwrap();
        assert_eq!(status.html_file_name.as_deref(), Some("pancakes.html"));
        assert_eq!(
            h.notes.status_history("n1").last().map(|u| u.status),
            Some(NoteStatus::Processing)
        );
    }

    #[tokio::test]
    async fn test_register_totals_completes_empty_categories() {
        let h = harness();
        let ctx = ctx(WorkerType::Note);
        let payload = note(0, 3, 0);
        InitializeNoteCompletionAction
            .execute(payload.clone(), &h.deps, &ctx)
            .await
            .unwrap();
        RegisterNoteTotalsAction
            .execute(payload, &h.deps, &ctx)
            .await
            .unwrap();

        let status = h.deps.completion.get_note_completion_status("n1").unwrap();
        assert!(status.instruction_worker_completed);
        assert!(status.image_worker_completed);
        assert!(!status.ingredient_worker_completed);
        assert_eq!(status.total_ingredient_lines, 3);
    }

    #[tokio::test]
    async fn test_empty_note_completes_with_note_worker() {
        let h = harness();
        let ctx = ctx(WorkerType::Note);
        let payload = note(0, 0, 0);
        for action in [
            &InitializeNoteCompletionAction as &dyn Action,
            &RegisterNoteTotalsAction,
            &CompleteNoteWorkerAction,
        ] {
            action.execute(payload.clone(), &h.deps, &ctx).await.unwrap();
        }

        let terminal = h.broadcaster.events_with_context("import_complete");
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].status, NoteStatus::Completed);
        assert_eq!(h.cleanup.cleaned(), vec!["i1".to_string()]);
    }

    #[test]
    fn test_validation_requires_ids() {
        let mut payload = note(0, 0, 0);
        if let JobPayload::Note(job) = &mut payload {
            job.import_id.clear();
        }
        assert!(InitializeNoteCompletionAction.validate_input(&payload).is_err());
        assert!(RegisterNoteTotalsAction.validate_input(&payload).is_ok());
    }

    #[test]
    fn test_start_message_uses_file_name() {
        assert_eq!(
            InitializeNoteCompletionAction.start_message(&note(0, 0, 0)),
            Some("Importing pancakes.html".to_string())
        );
    }
}
