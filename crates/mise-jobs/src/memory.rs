//! In-memory collaborators for tests and single-process deployments.
//!
//! Each store records what it was asked to do and can be switched into a
//! failing mode, so best-effort paths can be exercised without a database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use mise_core::{
    Error, ImageStore, ImportCleanup, IngredientLine, IngredientRepository, InstructionLine,
    InstructionRepository, NoteRepository, NoteStatus, NoteStatusUpdate, Result,
    StatusBroadcaster, StatusEvent, StoredImage,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// NOTES AND LINES
// =============================================================================

/// Note, instruction and ingredient persistence backed by concurrent maps.
#[derive(Default)]
pub struct MemoryNoteStore {
    statuses: DashMap<String, Vec<NoteStatusUpdate>>,
    titles: DashMap<String, String>,
    instructions: DashMap<String, BTreeMap<u32, InstructionLine>>,
    ingredients: DashMap<String, BTreeMap<(u32, u32), IngredientLine>>,
    failing: AtomicBool,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_title(&self, note_id: &str, title: impl Into<String>) {
        self.titles.insert(note_id.to_string(), title.into());
    }

    /// Make every call fail with a persistence error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every status written for the note, oldest first.
    pub fn status_history(&self, note_id: &str) -> Vec<NoteStatusUpdate> {
        self.statuses
            .get(note_id)
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    pub fn current_status(&self, note_id: &str) -> Option<NoteStatus> {
        self.statuses
            .get(note_id)
            .and_then(|history| history.last().map(|update| update.status))
    }

    /// Stored instruction lines ordered by line index.
    pub fn instruction_lines(&self, note_id: &str) -> Vec<InstructionLine> {
        self.instructions
            .get(note_id)
            .map(|lines| lines.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored ingredient lines ordered by block, then line index.
    pub fn ingredient_lines(&self, note_id: &str) -> Vec<IngredientLine> {
        self.ingredients
            .get(note_id)
            .map(|lines| lines.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Persistence("note store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl NoteRepository for MemoryNoteStore {
    async fn update_note_status(&self, note_id: &str, update: NoteStatusUpdate) -> Result<()> {
        self.check()?;
        self.statuses
            .entry(note_id.to_string())
            .or_default()
            .push(update);
        Ok(())
    }

    async fn get_note_title(&self, note_id: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.titles.get(note_id).map(|title| title.clone()))
    }
}

#[async_trait]
impl InstructionRepository for MemoryNoteStore {
    async fn save_instruction_line(&self, line: InstructionLine) -> Result<String> {
        self.check()?;
        let id = format!("{}:instruction:{}", line.note_id, line.line_index);
        self.instructions
            .entry(line.note_id.clone())
            .or_default()
            .insert(line.line_index, line);
        Ok(id)
    }
}

#[async_trait]
impl IngredientRepository for MemoryNoteStore {
    async fn save_ingredient_line(&self, line: IngredientLine) -> Result<String> {
        self.check()?;
        let id = format!("{}:ingredient:{}", line.note_id, line.line_key());
        self.ingredients
            .entry(line.note_id.clone())
            .or_default()
            .insert((line.block_index, line.line_index), line);
        Ok(id)
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcaster that keeps every event it was handed.
#[derive(Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<StatusEvent>>,
    failing: AtomicBool,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every broadcast. Rejected events are not recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        lock(&self.events).clone()
    }

    pub fn events_with_status(&self, status: NoteStatus) -> Vec<StatusEvent> {
        lock(&self.events)
            .iter()
            .filter(|event| event.status == status)
            .cloned()
            .collect()
    }

    pub fn events_with_context(&self, context: &str) -> Vec<StatusEvent> {
        lock(&self.events)
            .iter()
            .filter(|event| event.context == context)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[async_trait]
impl StatusBroadcaster for RecordingBroadcaster {
    async fn broadcast(&self, event: StatusEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Broadcast("no transport available".into()));
        }
        lock(&self.events).push(event);
        Ok(())
    }
}

// =============================================================================
// FILES
// =============================================================================

/// Cleanup that only records which imports it was asked to remove.
#[derive(Default)]
pub struct RecordingCleanup {
    cleaned: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn cleaned(&self) -> Vec<String> {
        lock(&self.cleaned).clone()
    }
}

#[async_trait]
impl ImportCleanup for RecordingCleanup {
    async fn cleanup_import_directory(&self, import_id: &str) -> Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("cannot remove import {import_id}")));
        }
        lock(&self.cleaned).push(import_id.to_string());
        Ok(true)
    }
}

/// Image store that hands out `memory://` URLs.
#[derive(Default)]
pub struct MemoryImageStore {
    uploads: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful uploads.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn upload_image(&self, note_id: &str, image_path: &str) -> Result<StoredImage> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("upload failed: {image_path}")));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(StoredImage {
            image_id: Uuid::now_v7().to_string(),
            url: format!("memory://{note_id}/{image_path}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruction(index: u32, text: &str) -> InstructionLine {
        InstructionLine {
            note_id: "n1".into(),
            line_index: index,
            reference: text.into(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_instruction_lines_upsert_by_index() {
        let store = MemoryNoteStore::new();
        store.save_instruction_line(instruction(1, "Bake.")).await.unwrap();
        store.save_instruction_line(instruction(0, "Mix.")).await.unwrap();
        let id = store
            .save_instruction_line(instruction(1, "Bake well."))
            .await
            .unwrap();

        assert_eq!(id, "n1:instruction:1");
        let lines = store.instruction_lines("n1");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].reference, "Mix.");
        assert_eq!(lines[1].reference, "Bake well.");
    }

    #[tokio::test]
    async fn test_status_history_and_title() {
        let store = MemoryNoteStore::new();
        store.set_title("n1", "Pancakes");
        store
            .update_note_status("n1", NoteStatusUpdate::status(NoteStatus::Processing))
            .await
            .unwrap();
        store
            .update_note_status("n1", NoteStatusUpdate::status(NoteStatus::Completed))
            .await
            .unwrap();

        assert_eq!(store.status_history("n1").len(), 2);
        assert_eq!(store.current_status("n1"), Some(NoteStatus::Completed));
        assert_eq!(
            store.get_note_title("n1").await.unwrap().as_deref(),
            Some("Pancakes")
        );
        assert!(store.get_note_title("n2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_store_rejects_writes() {
        let store = MemoryNoteStore::new();
        store.set_failing(true);
        let err = store
            .update_note_status("n1", NoteStatusUpdate::status(NoteStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(store.status_history("n1").is_empty());
    }

    #[tokio::test]
    async fn test_recording_broadcaster_filters() {
        let broadcaster = RecordingBroadcaster::new();
        broadcaster
            .broadcast(StatusEvent::new("i1", NoteStatus::Processing, "image_upload", "1/2"))
            .await
            .unwrap();
        broadcaster
            .broadcast(StatusEvent::new("i1", NoteStatus::Completed, "import_complete", "done"))
            .await
            .unwrap();

        assert_eq!(broadcaster.events().len(), 2);
        assert_eq!(broadcaster.events_with_status(NoteStatus::Completed).len(), 1);
        assert_eq!(broadcaster.events_with_context("image_upload")[0].message, "1/2");

        broadcaster.set_failing(true);
        assert!(broadcaster
            .broadcast(StatusEvent::new("i1", NoteStatus::Failed, "import_failed", "x"))
            .await
            .is_err());
        assert_eq!(broadcaster.events().len(), 2);
    }

    #[tokio::test]
    async fn test_image_store_counts_uploads() {
        let images = MemoryImageStore::new();
        let stored = images.upload_image("n1", "a.jpg").await.unwrap();
        assert_eq!(stored.url, "memory://n1/a.jpg");
        assert_eq!(images.upload_count(), 1);

        images.set_failing(true);
        assert!(matches!(
            images.upload_image("n1", "b.jpg").await,
            Err(Error::Storage(_))
        ));
        assert_eq!(images.upload_count(), 1);
    }
}
