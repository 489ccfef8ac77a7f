//! Action registry and pipeline selection.

use std::collections::HashMap;
use std::sync::Arc;

use mise_core::{Error, Result};

use super::*;
use crate::payload::JobPayload;

/// The ordered action names to run for a payload.
///
/// Total over every payload kind. Line kinds carrying tracking data get a
/// progress step in front.
pub fn pipeline_plan(payload: &JobPayload) -> Vec<ActionName> {
    let tracked = payload.tracking().is_some();
    let mut plan = Vec::with_capacity(4);

    match payload {
        JobPayload::Note(_) => plan.extend([
            ActionName::InitializeNoteCompletion,
            ActionName::RegisterNoteTotals,
            ActionName::CompleteNoteWorker,
        ]),
        JobPayload::InstructionLine(_) => {
            if tracked {
                plan.push(ActionName::UpdateInstructionCount);
            }
            plan.extend([ActionName::FormatInstruction, ActionName::SaveInstruction]);
        }
        JobPayload::InstructionCompletion(_) => {
            if tracked {
                plan.push(ActionName::UpdateInstructionCount);
            }
            plan.push(ActionName::CheckInstructionCompletion);
        }
        JobPayload::IngredientLine(_) => {
            if tracked {
                plan.push(ActionName::UpdateIngredientCount);
            }
            plan.extend([ActionName::SaveIngredientLine, ActionName::TrackIngredientLine]);
        }
        JobPayload::IngredientCompletion(_) => {
            if tracked {
                plan.push(ActionName::UpdateIngredientCount);
            }
            plan.push(ActionName::CheckIngredientCompletion);
        }
        JobPayload::Image(_) => plan.extend([ActionName::UploadImage, ActionName::TrackImageCompletion]),
    }

    plan
}

/// Registry mapping action names to their implementations.
pub struct ActionFactory {
    actions: HashMap<ActionName, Arc<dyn Action>>,
}

impl ActionFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Create a factory with every built-in action registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        let builtin: [Arc<dyn Action>; 13] = [
            Arc::new(InitializeNoteCompletionAction),
            Arc::new(RegisterNoteTotalsAction),
            Arc::new(CompleteNoteWorkerAction),
            Arc::new(UpdateInstructionCountAction),
            Arc::new(FormatInstructionAction),
            Arc::new(SaveInstructionAction),
            Arc::new(CheckInstructionCompletionAction),
            Arc::new(UpdateIngredientCountAction),
            Arc::new(SaveIngredientLineAction),
            Arc::new(TrackIngredientLineAction),
            Arc::new(CheckIngredientCompletionAction),
            Arc::new(UploadImageAction),
            Arc::new(TrackImageCompletionAction),
        ];
        for action in builtin {
            factory.register(action);
        }
        factory
    }

    /// Register an action. Replaces any existing action with the same name.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name(), action);
    }

    /// Look up the action registered under `name`.
    pub fn create(&self, name: ActionName) -> Result<Arc<dyn Action>> {
        self.actions
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("No action registered for: {name}")))
    }

    /// Check if an action is registered under `name`.
    pub fn has_action(&self, name: ActionName) -> bool {
        self.actions.contains_key(&name)
    }

    /// Build the pipeline for a payload.
    pub fn build_pipeline(&self, payload: &JobPayload) -> Result<Pipeline> {
        pipeline_plan(payload)
            .into_iter()
            .map(|name| self.create(name))
            .collect::<Result<Vec<_>>>()
            .map(Pipeline::new)
    }
}

impl Default for ActionFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{CompletionCheckJob, ImageJob, IngredientLineJob, LineTracking, NoteJob};

    fn ingredient_line(tracking: Option<LineTracking>) -> JobPayload {
        JobPayload::IngredientLine(IngredientLineJob {
            note_id: "n1".into(),
            import_id: "i1".into(),
            block_index: 0,
            line_index: 0,
            reference: "1 cup flour".into(),
            parsed: None,
            ingredient_line_id: None,
            tracking,
        })
    }

    #[test]
    fn test_instruction_plans() {
        let line = JobPayload::instruction("n1", "i1", 0, Some("Mix".into()), None);
        assert_eq!(
            pipeline_plan(&line),
            vec![ActionName::FormatInstruction, ActionName::SaveInstruction]
        );

        let check = JobPayload::instruction("n1", "i1", 0, None, None);
        assert_eq!(
            pipeline_plan(&check),
            vec![ActionName::CheckInstructionCompletion]
        );

        let tracked = JobPayload::instruction(
            "n1",
            "i1",
            0,
            Some("Mix".into()),
            Some(LineTracking::new(1, 2)),
        );
        assert_eq!(
            pipeline_plan(&tracked),
            vec![
                ActionName::UpdateInstructionCount,
                ActionName::FormatInstruction,
                ActionName::SaveInstruction,
            ]
        );
    }

    #[test]
    fn test_other_plans() {
        let note = JobPayload::Note(NoteJob {
            note_id: "n1".into(),
            import_id: "i1".into(),
            html_file_name: None,
            total_instructions: 1,
            total_ingredient_lines: 1,
            total_image_jobs: 1,
        });
        assert_eq!(pipeline_plan(&note).len(), 3);

        assert_eq!(
            pipeline_plan(&ingredient_line(Some(LineTracking::new(1, 1))))[0],
            ActionName::UpdateIngredientCount
        );
        assert_eq!(
            pipeline_plan(&ingredient_line(None)),
            vec![ActionName::SaveIngredientLine, ActionName::TrackIngredientLine]
        );

        let check = JobPayload::IngredientCompletion(CompletionCheckJob {
            note_id: "n1".into(),
            import_id: "i1".into(),
            tracking: None,
        });
        assert_eq!(
            pipeline_plan(&check),
            vec![ActionName::CheckIngredientCompletion]
        );

        let image = JobPayload::Image(ImageJob {
            note_id: "n1".into(),
            import_id: "i1".into(),
            image_path: "a.jpg".into(),
            image: None,
        });
        assert_eq!(
            pipeline_plan(&image),
            vec![ActionName::UploadImage, ActionName::TrackImageCompletion]
        );
    }

    #[test]
    fn test_defaults_cover_every_plan() {
        let factory = ActionFactory::with_defaults();
        let line = JobPayload::instruction("n1", "i1", 0, Some("Mix".into()), None);
        let pipeline = factory.build_pipeline(&line).unwrap();
        assert_eq!(
            pipeline.names(),
            vec![ActionName::FormatInstruction, ActionName::SaveInstruction]
        );
        assert!(factory.has_action(ActionName::TrackImageCompletion));
    }

    #[test]
    fn test_missing_action_is_an_error() {
        let factory = ActionFactory::new();
        let line = JobPayload::instruction("n1", "i1", 0, Some("Mix".into()), None);
        let err = factory.build_pipeline(&line).unwrap_err();
        assert!(err.to_string().contains("format_instruction"));
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut factory = ActionFactory::new();
        factory.register(Arc::new(FormatInstructionAction));
        factory.register(Arc::new(FormatInstructionAction));
        assert!(factory.has_action(ActionName::FormatInstruction));
        assert!(!factory.has_action(ActionName::SaveInstruction));
        assert!(factory.create(ActionName::SaveInstruction).is_err());
    }
}
