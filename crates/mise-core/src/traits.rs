//! Collaborator traits consumed by the job system.
//!
//! Persistence, upload, broadcast transport and file cleanup live outside the
//! orchestration core. These traits are the narrow seams it talks through,
//! enabling pluggable backends and testability.

use async_trait::async_trait;

use crate::error::Result;
use crate::events::StatusEvent;
use crate::models::*;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Note lifecycle persistence.
#[async_trait]
pub trait NoteRepository: Send + Sync {
    /// Write a note's lifecycle status (PROCESSING/COMPLETED/FAILED).
    async fn update_note_status(&self, note_id: &str, update: NoteStatusUpdate) -> Result<()>;

    /// Look up the note title for friendlier status messages.
    async fn get_note_title(&self, note_id: &str) -> Result<Option<String>>;
}

/// Instruction line persistence.
#[async_trait]
pub trait InstructionRepository: Send + Sync {
    /// Store (upsert) an instruction line, returning its record id.
    async fn save_instruction_line(&self, line: InstructionLine) -> Result<String>;
}

/// Ingredient line persistence.
#[async_trait]
pub trait IngredientRepository: Send + Sync {
    /// Store (upsert) an ingredient line, returning its record id.
    async fn save_ingredient_line(&self, line: IngredientLine) -> Result<String>;
}

// =============================================================================
// FILES
// =============================================================================

/// Image upload backend.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Upload an image extracted from the note's import directory.
    async fn upload_image(&self, note_id: &str, image_path: &str) -> Result<StoredImage>;
}

/// Removal of per-import temporary storage.
#[async_trait]
pub trait ImportCleanup: Send + Sync {
    /// Remove the import's working directory. Returns `false` when there was
    /// nothing to remove.
    async fn cleanup_import_directory(&self, import_id: &str) -> Result<bool>;
}

// =============================================================================
// STATUS BROADCAST
// =============================================================================

/// Pushes status updates to subscribed clients.
#[async_trait]
pub trait StatusBroadcaster: Send + Sync {
    async fn broadcast(&self, event: StatusEvent) -> Result<()>;
}

/// Broadcaster that drops every event, for deployments without live clients.
pub struct NoOpBroadcaster;

#[async_trait]
impl StatusBroadcaster for NoOpBroadcaster {
    async fn broadcast(&self, _event: StatusEvent) -> Result<()> {
        Ok(())
    }
}
