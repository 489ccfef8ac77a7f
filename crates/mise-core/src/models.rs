//! Domain models shared by the job system and its collaborators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;

// =============================================================================
// WORKER TYPES
// =============================================================================

/// Independent processing track for a note. A note import is finished once
/// every worker type has reported completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// Parses the note HTML and fans out the per-line jobs
    Note,
    /// Formats and stores instruction lines
    Instruction,
    /// Stores and tracks ingredient lines
    Ingredient,
    /// Uploads the note's images
    Image,
}

impl WorkerType {
    /// Every worker type, in pipeline order.
    pub const ALL: [WorkerType; 4] = [
        WorkerType::Note,
        WorkerType::Instruction,
        WorkerType::Ingredient,
        WorkerType::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Note => "note",
            WorkerType::Instruction => "instruction",
            WorkerType::Ingredient => "ingredient",
            WorkerType::Image => "image",
        }
    }

    /// Default priority for jobs of this worker type (higher = more urgent).
    ///
    /// Note jobs gate everything else; images are the slowest and least urgent.
    pub fn default_priority(&self) -> i32 {
        match self {
            WorkerType::Note => 9,
            WorkerType::Instruction => 5,
            WorkerType::Ingredient => 5,
            WorkerType::Image => 2,
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "note" => Ok(WorkerType::Note),
            "instruction" => Ok(WorkerType::Instruction),
            "ingredient" => Ok(WorkerType::Ingredient),
            "image" => Ok(WorkerType::Image),
            other => Err(Error::Validation(format!("unknown worker type: {other}"))),
        }
    }
}

// =============================================================================
// NOTE STATUS
// =============================================================================

/// Persisted lifecycle status of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoteStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl NoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteStatus::Pending => "PENDING",
            NoteStatus::Processing => "PROCESSING",
            NoteStatus::Completed => "COMPLETED",
            NoteStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing error codes attached to failed notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportErrorCode {
    HtmlParseError,
    IngredientParseError,
    InstructionParseError,
    QueueJobFailed,
    ImageUploadFailed,
    UnknownError,
}

impl ImportErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportErrorCode::HtmlParseError => "HTML_PARSE_ERROR",
            ImportErrorCode::IngredientParseError => "INGREDIENT_PARSE_ERROR",
            ImportErrorCode::InstructionParseError => "INSTRUCTION_PARSE_ERROR",
            ImportErrorCode::QueueJobFailed => "QUEUE_JOB_FAILED",
            ImportErrorCode::ImageUploadFailed => "IMAGE_UPLOAD_FAILED",
            ImportErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Code reported when a worker's job exhausts its retries.
    pub fn for_worker(worker: WorkerType) -> Self {
        match worker {
            WorkerType::Note => ImportErrorCode::HtmlParseError,
            WorkerType::Instruction => ImportErrorCode::InstructionParseError,
            WorkerType::Ingredient => ImportErrorCode::IngredientParseError,
            WorkerType::Image => ImportErrorCode::ImageUploadFailed,
        }
    }
}

impl fmt::Display for ImportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write request for a note's persisted status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteStatusUpdate {
    pub status: NoteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ImportErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<JsonValue>,
}

impl NoteStatusUpdate {
    /// A plain status transition without error metadata.
    pub fn status(status: NoteStatus) -> Self {
        Self {
            status,
            error_message: None,
            error_code: None,
            error_details: None,
        }
    }

    /// A `FAILED` transition carrying error metadata.
    pub fn failed(
        message: impl Into<String>,
        code: ImportErrorCode,
        details: Option<JsonValue>,
    ) -> Self {
        Self {
            status: NoteStatus::Failed,
            error_message: Some(message.into()),
            error_code: Some(code),
            error_details: details,
        }
    }
}

// =============================================================================
// LINE RECORDS
// =============================================================================

/// An instruction line ready to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionLine {
    pub note_id: String,
    /// Position of the line within the note's instruction list.
    pub line_index: u32,
    /// Formatted instruction text.
    pub reference: String,
    /// Inactive lines are kept for fidelity but hidden from recipe views.
    pub is_active: bool,
}

/// An ingredient line ready to be stored. Parsing happens upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngredientLine {
    pub note_id: String,
    pub block_index: u32,
    pub line_index: u32,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<JsonValue>,
}

impl IngredientLine {
    /// Composite key used by completion tracking (`"block:line"`).
    pub fn line_key(&self) -> String {
        format!("{}:{}", self.block_index, self.line_index)
    }
}

/// Result of uploading a note image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    pub image_id: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_type_round_trip_str() {
        for worker in WorkerType::ALL {
            let parsed: WorkerType = worker.as_str().parse().unwrap();
            assert_eq!(parsed, worker);
        }
    }

    #[test]
    fn test_worker_type_parse_is_case_insensitive() {
        assert_eq!("  Image ".parse::<WorkerType>().unwrap(), WorkerType::Image);
        assert!("recipe".parse::<WorkerType>().is_err());
    }

    #[test]
    fn test_worker_type_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerType::Ingredient).unwrap();
        assert_eq!(json, r#""ingredient""#);
    }

    #[test]
    fn test_note_status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_value(NoteStatus::Completed).unwrap(),
            json!("COMPLETED")
        );
        assert_eq!(NoteStatus::Processing.to_string(), "PROCESSING");
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_value(ImportErrorCode::QueueJobFailed).unwrap(),
            json!("QUEUE_JOB_FAILED")
        );
        assert_eq!(
            ImportErrorCode::ImageUploadFailed.as_str(),
            "IMAGE_UPLOAD_FAILED"
        );
    }

    #[test]
    fn test_error_code_for_worker() {
        assert_eq!(
            ImportErrorCode::for_worker(WorkerType::Image),
            ImportErrorCode::ImageUploadFailed
        );
        assert_eq!(
            ImportErrorCode::for_worker(WorkerType::Note),
            ImportErrorCode::HtmlParseError
        );
    }

    #[test]
    fn test_failed_status_update_carries_metadata() {
        let update = NoteStatusUpdate::failed(
            "bad html",
            ImportErrorCode::HtmlParseError,
            Some(json!({"line": 3})),
        );
        assert_eq!(update.status, NoteStatus::Failed);
        assert_eq!(update.error_message.as_deref(), Some("bad html"));
        assert_eq!(update.error_code, Some(ImportErrorCode::HtmlParseError));

        let plain = serde_json::to_value(NoteStatusUpdate::status(NoteStatus::Processing)).unwrap();
        assert_eq!(plain, json!({"status": "PROCESSING"}));
    }

    #[test]
    fn test_ingredient_line_key() {
        let line = IngredientLine {
            note_id: "n1".into(),
            block_index: 2,
            line_index: 7,
            reference: "1 cup flour".into(),
            parsed: None,
        };
        assert_eq!(line.line_key(), "2:7");
    }
}
