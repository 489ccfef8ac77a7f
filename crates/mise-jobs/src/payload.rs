//! Job payloads.
//!
//! Every job carries exactly one [`JobPayload`] variant. The variant is chosen
//! when the job is created and is the only thing pipeline selection looks at.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use mise_core::{StoredImage, WorkerType};

/// Position of a line within its worker's batch, for progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTracking {
    /// 1-based index of the current line.
    pub current_index: u32,
    pub total: u32,
}

impl LineTracking {
    pub fn new(current_index: u32, total: u32) -> Self {
        Self {
            current_index,
            total,
        }
    }

    /// True for the last line of the batch (or an empty batch).
    pub fn is_last(&self) -> bool {
        self.current_index >= self.total
    }
}

/// Parse a note and start tracking it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteJob {
    pub note_id: String,
    pub import_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_file_name: Option<String>,
    #[serde(default)]
    pub total_instructions: u32,
    #[serde(default)]
    pub total_ingredient_lines: u32,
    #[serde(default)]
    pub total_image_jobs: u32,
}

/// Format and store one instruction line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionLineJob {
    pub note_id: String,
    pub import_id: String,
    pub line_index: u32,
    /// Raw text until formatted, formatted text afterwards. May be empty.
    pub instruction_reference: String,
    /// Set by formatting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    /// Set once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_line_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<LineTracking>,
}

/// Check whether a worker has finished all lines of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCheckJob {
    pub note_id: String,
    pub import_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<LineTracking>,
}

/// Store and track one parsed ingredient line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientLineJob {
    pub note_id: String,
    pub import_id: String,
    pub block_index: u32,
    pub line_index: u32,
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<JsonValue>,
    /// Set once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredient_line_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<LineTracking>,
}

/// Upload one image of a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageJob {
    pub note_id: String,
    pub import_id: String,
    pub image_path: String,
    /// Set once uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<StoredImage>,
}

/// Tagged job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Note(NoteJob),
    InstructionLine(InstructionLineJob),
    InstructionCompletion(CompletionCheckJob),
    IngredientLine(IngredientLineJob),
    IngredientCompletion(CompletionCheckJob),
    Image(ImageJob),
}

impl JobPayload {
    /// Build an instruction job. A reference (even an empty one) makes a line
    /// job; no reference makes a completion check.
    pub fn instruction(
        note_id: impl Into<String>,
        import_id: impl Into<String>,
        line_index: u32,
        reference: Option<String>,
        tracking: Option<LineTracking>,
    ) -> Self {
        let note_id = note_id.into();
        let import_id = import_id.into();
        match reference {
            Some(instruction_reference) => JobPayload::InstructionLine(InstructionLineJob {
                note_id,
                import_id,
                line_index,
                instruction_reference,
                is_active: None,
                instruction_line_id: None,
                tracking,
            }),
            None => JobPayload::InstructionCompletion(CompletionCheckJob {
                note_id,
                import_id,
                tracking,
            }),
        }
    }

    /// Short name of the variant, as used for the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::Note(_) => "note",
            JobPayload::InstructionLine(_) => "instruction_line",
            JobPayload::InstructionCompletion(_) => "instruction_completion",
            JobPayload::IngredientLine(_) => "ingredient_line",
            JobPayload::IngredientCompletion(_) => "ingredient_completion",
            JobPayload::Image(_) => "image",
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        match self {
            JobPayload::Note(_) => WorkerType::Note,
            JobPayload::InstructionLine(_) | JobPayload::InstructionCompletion(_) => {
                WorkerType::Instruction
            }
            JobPayload::IngredientLine(_) | JobPayload::IngredientCompletion(_) => {
                WorkerType::Ingredient
            }
            JobPayload::Image(_) => WorkerType::Image,
        }
    }

    pub fn note_id(&self) -> &str {
        match self {
            JobPayload::Note(job) => &job.note_id,
            JobPayload::InstructionLine(job) => &job.note_id,
            JobPayload::InstructionCompletion(job) | JobPayload::IngredientCompletion(job) => {
                &job.note_id
            }
            JobPayload::IngredientLine(job) => &job.note_id,
            JobPayload::Image(job) => &job.note_id,
        }
    }

    pub fn import_id(&self) -> &str {
        match self {
            JobPayload::Note(job) => &job.import_id,
            JobPayload::InstructionLine(job) => &job.import_id,
            JobPayload::InstructionCompletion(job) | JobPayload::IngredientCompletion(job) => {
                &job.import_id
            }
            JobPayload::IngredientLine(job) => &job.import_id,
            JobPayload::Image(job) => &job.import_id,
        }
    }

    /// Line tracking, for the kinds that carry it.
    pub fn tracking(&self) -> Option<LineTracking> {
        match self {
            JobPayload::InstructionLine(job) => job.tracking,
            JobPayload::InstructionCompletion(job) | JobPayload::IngredientCompletion(job) => {
                job.tracking
            }
            JobPayload::IngredientLine(job) => job.tracking,
            JobPayload::Note(_) | JobPayload::Image(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instruction_constructor_picks_variant() {
        let line = JobPayload::instruction("n1", "i1", 0, Some("Mix".into()), None);
        assert!(matches!(line, JobPayload::InstructionLine(_)));

        let empty = JobPayload::instruction("n1", "i1", 0, Some(String::new()), None);
        assert!(matches!(empty, JobPayload::InstructionLine(_)));

        let check = JobPayload::instruction("n1", "i1", 0, None, Some(LineTracking::new(3, 3)));
        assert!(matches!(check, JobPayload::InstructionCompletion(_)));
        assert_eq!(check.tracking(), Some(LineTracking::new(3, 3)));
    }

    #[test]
    fn test_worker_type_and_ids() {
        let payload = JobPayload::Image(ImageJob {
            note_id: "n1".into(),
            import_id: "i1".into(),
            image_path: "img/1.jpg".into(),
            image: None,
        });
        assert_eq!(payload.worker_type(), WorkerType::Image);
        assert_eq!(payload.note_id(), "n1");
        assert_eq!(payload.import_id(), "i1");
        assert_eq!(payload.kind(), "image");
        assert!(payload.tracking().is_none());
    }

    #[test]
    fn test_payload_tagged_wire_format() {
        let payload = JobPayload::instruction("n1", "i1", 2, None, None);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({"kind": "instruction_completion", "note_id": "n1", "import_id": "i1"})
        );
    }

    #[test]
    fn test_payload_deserializes_with_defaults() {
        let payload: JobPayload = serde_json::from_value(json!({
            "kind": "note",
            "note_id": "n1",
            "import_id": "i1",
            "total_image_jobs": 2
        }))
        .unwrap();
        match payload {
            JobPayload::Note(job) => {
                assert_eq!(job.total_image_jobs, 2);
                assert_eq!(job.total_instructions, 0);
                assert!(job.html_file_name.is_none());
            }
            other => panic!("expected note payload, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result = serde_json::from_value::<JobPayload>(json!({"kind": "recipe", "note_id": "n1"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_line_tracking_is_last() {
        assert!(!LineTracking::new(1, 3).is_last());
        assert!(LineTracking::new(3, 3).is_last());
        assert!(LineTracking::new(0, 0).is_last());
    }
}
