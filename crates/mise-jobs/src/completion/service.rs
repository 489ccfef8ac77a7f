//! Completion service: the operations workers call, and the side effects fired
//! when a note finishes or fails.
//!
//! Collaborator failures never escape this module. Each side effect is its own
//! fallible call with a log-and-continue policy, so reaching "all completed"
//! sticks even when persistence, broadcast or cleanup is flaky.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use mise_core::{
    ImportCleanup, ImportErrorCode, NoteRepository, NoteStatus, NoteStatusUpdate,
    StatusBroadcaster, StatusEvent, WorkerType,
};

use super::tracker::{
    CompletionTracker, EvictedRecord, FailureClaim, ImageProgress, IngredientProgress,
    MarkOutcome, NoteCompletionStatus,
};
use super::CompletionConfig;

/// Status event context of the terminal completion broadcast.
pub const IMPORT_COMPLETE_CONTEXT: &str = "import_complete";
/// Status event context of the failure broadcast.
pub const IMPORT_FAILED_CONTEXT: &str = "import_failed";
/// Status event context of image progress broadcasts.
pub const IMAGE_UPLOAD_CONTEXT: &str = "image_upload";

/// Tracks per-note completion across workers and fires the completion side
/// effects exactly once per note.
pub struct CompletionService {
    tracker: CompletionTracker,
    notes: Arc<dyn NoteRepository>,
    broadcaster: Arc<dyn StatusBroadcaster>,
    cleanup: Arc<dyn ImportCleanup>,
    config: CompletionConfig,
}

impl CompletionService {
    pub fn new(
        notes: Arc<dyn NoteRepository>,
        broadcaster: Arc<dyn StatusBroadcaster>,
        cleanup: Arc<dyn ImportCleanup>,
    ) -> Self {
        Self {
            tracker: CompletionTracker::new(),
            notes,
            broadcaster,
            cleanup,
            config: CompletionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CompletionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CompletionConfig {
        &self.config
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// Start tracking a note and mark it PROCESSING.
    ///
    /// The status write is best-effort; a failure is logged and the record is
    /// still created.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "completion", op = "initialize"))]
    pub async fn initialize_note_completion(
        &self,
        note_id: &str,
        import_id: &str,
        html_file_name: Option<&str>,
    ) {
        self.tracker
            .initialize(note_id, import_id, html_file_name.map(str::to_string));
        debug!("Completion tracking initialized");

        if let Err(e) = self
            .notes
            .update_note_status(note_id, NoteStatusUpdate::status(NoteStatus::Processing))
            .await
        {
            warn!(error = %e, "Failed to mark note PROCESSING");
        }
    }

    pub fn set_total_image_jobs(&self, note_id: &str, total: u32) {
        if self.tracker.set_total_image_jobs(note_id, total) {
            debug!(note_id, total, "Total image jobs set");
        } else {
            warn!(note_id, total, "Cannot set image total: note is not tracked");
        }
    }

    pub fn set_total_ingredient_lines(&self, note_id: &str, total: u32) {
        if self.tracker.set_total_ingredient_lines(note_id, total) {
            debug!(note_id, total, "Total ingredient lines set");
        } else {
            warn!(note_id, total, "Cannot set ingredient total: note is not tracked");
        }
    }

    /// Count a finished image job, broadcasting progress at each milestone and
    /// completing the image worker once every image is in.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "completion", op = "mark_image_job_completed"))]
    pub async fn mark_image_job_completed(&self, note_id: &str) -> Option<ImageProgress> {
        let Some(progress) = self
            .tracker
            .record_image_job(note_id, self.config.image_progress_step_percent)
        else {
            warn!("Image job completed for untracked note");
            return None;
        };

        if let Some(percent) = progress.milestone {
            self.broadcast_image_progress(note_id, &progress, percent)
                .await;
        }

        if progress.all_done {
            self.mark_worker_completed(note_id, WorkerType::Image).await;
        }

        Some(progress)
    }

    /// Record a stored ingredient line. Does not complete the ingredient
    /// worker; that takes an explicit [`Self::mark_worker_completed`].
    ///
    /// Returns the updated progress, or `None` for untracked notes.
    pub fn mark_ingredient_line_completed(
        &self,
        note_id: &str,
        block_index: u32,
        line_index: u32,
    ) -> Option<IngredientProgress> {
        let progress = self
            .tracker
            .record_ingredient_line(note_id, block_index, line_index);
        match &progress {
            Some(progress) => debug!(
                note_id,
                block_index,
                line_index,
                completed = progress.completed,
                total = progress.total,
                "Ingredient line completed"
            ),
            None => warn!(
                note_id,
                block_index, line_index, "Ingredient line completed for untracked note"
            ),
        }
        progress
    }

    /// Mark one worker type done for a note.
    ///
    /// When this call is the one that completes the note, persists COMPLETED,
    /// broadcasts the terminal event and cleans up the import directory.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "completion", op = "mark_worker_completed"))]
    pub async fn mark_worker_completed(&self, note_id: &str, worker: WorkerType) -> MarkOutcome {
        let outcome = self.tracker.mark_worker(note_id, worker);

        match &outcome {
            MarkOutcome::Unknown => warn!("Worker completed for untracked note"),
            MarkOutcome::Partial { pending } => {
                debug!(?pending, "Worker completed, note still in progress")
            }
            MarkOutcome::AlreadyCompleted => debug!("Worker completed after note completion"),
            MarkOutcome::Completed(status) => self.on_note_completed(status).await,
        }

        outcome
    }

    pub fn get_note_completion_status(&self, note_id: &str) -> Option<NoteCompletionStatus> {
        self.tracker.get(note_id)
    }

    pub fn get_ingredient_completion_status(&self, note_id: &str) -> IngredientProgress {
        self.tracker.ingredient_progress(note_id)
    }

    /// Drop a note's tracking record. Safe on unknown notes.
    pub fn cleanup_note_completion(&self, note_id: &str) {
        if self.tracker.remove(note_id).is_some() {
            debug!(note_id, "Completion record removed");
        }
    }

    /// Persist FAILED, stop tracking the note, and clean up its import.
    ///
    /// Failure is terminal: the note can no longer complete afterwards. A note
    /// that already completed (or failed) is left as it is.
    #[instrument(skip(self, message, details), fields(subsystem = "jobs", component = "completion", op = "mark_note_as_failed"))]
    pub async fn mark_note_as_failed(
        &self,
        note_id: &str,
        message: &str,
        code: Option<ImportErrorCode>,
        details: Option<JsonValue>,
    ) {
        let code = code.unwrap_or(ImportErrorCode::UnknownError);
        let record = match self.tracker.fail(note_id) {
            FailureClaim::Claimed(record) => record,
            FailureClaim::AlreadyFinished => {
                info!(error_code = %code, reason = message, "Note already finished, failure ignored");
                return;
            }
        };

        warn!(error_code = %code, reason = message, tracked = record.is_some(), "Note import failed");

        if let Err(e) = self
            .notes
            .update_note_status(
                note_id,
                NoteStatusUpdate::failed(message, code, details.clone()),
            )
            .await
        {
            warn!(error = %e, "Failed to persist FAILED status");
        }

        let Some(record) = record else {
            return;
        };

        let event = StatusEvent::new(
            &record.import_id,
            NoteStatus::Failed,
            IMPORT_FAILED_CONTEXT,
            message,
        )
        .with_note(note_id)
        .with_indent(0)
        .with_metadata(json!({
            "error_code": code,
            "error_details": details,
            "html_file_name": record.html_file_name,
        }));
        if let Err(e) = self.broadcaster.broadcast(event).await {
            warn!(error = %e, "Failed to broadcast failure");
        }

        self.cleanup_import(&record.import_id).await;
    }

    /// Evict expired records using the configured TTLs.
    pub fn sweep(&self) -> Vec<EvictedRecord> {
        let evicted =
            self.tracker
                .evict_expired(Utc::now(), self.config.stale_ttl, self.config.retention);
        for record in evicted.iter().filter(|r| !r.completed) {
            warn!(
                note_id = %record.note_id,
                import_id = %record.import_id,
                pending = ?record.pending,
                "Evicted stale completion record"
            );
        }
        evicted
    }

    async fn on_note_completed(&self, status: &NoteCompletionStatus) {
        let note_id = status.note_id.as_str();
        info!(import_id = %status.import_id, "All workers completed");

        if let Err(e) = self
            .notes
            .update_note_status(note_id, NoteStatusUpdate::status(NoteStatus::Completed))
            .await
        {
            warn!(error = %e, "Failed to persist COMPLETED status");
        }

        let title = match self.notes.get_note_title(note_id).await {
            Ok(title) => title,
            Err(e) => {
                debug!(error = %e, "Note title lookup failed");
                None
            }
        };

        let message = match &title {
            Some(title) => format!("Imported \"{title}\""),
            None => "Import completed".to_string(),
        };
        let event = StatusEvent::new(
            &status.import_id,
            NoteStatus::Completed,
            IMPORT_COMPLETE_CONTEXT,
            message,
        )
        .with_note(note_id)
        .with_indent(0)
        .with_metadata(json!({
            "note_title": title,
            "html_file_name": status.html_file_name,
            "total_image_jobs": status.total_image_jobs,
            "total_ingredient_lines": status.total_ingredient_lines,
        }));
        if let Err(e) = self.broadcaster.broadcast(event).await {
            warn!(error = %e, "Failed to broadcast completion");
        }

        self.cleanup_import(&status.import_id).await;
    }

    async fn broadcast_image_progress(&self, note_id: &str, progress: &ImageProgress, percent: u32) {
        let Some(import_id) = self.tracker.get(note_id).map(|r| r.import_id) else {
            return;
        };
        let event = StatusEvent::new(
            import_id,
            NoteStatus::Processing,
            IMAGE_UPLOAD_CONTEXT,
            format!("Uploaded {}/{} images", progress.completed, progress.total),
        )
        .with_note(note_id)
        .with_indent(2)
        .with_metadata(json!({
            "completed": progress.completed,
            "total": progress.total,
            "percent": percent,
        }));
        if let Err(e) = self.broadcaster.broadcast(event).await {
            warn!(error = %e, "Failed to broadcast image progress");
        }
    }

    async fn cleanup_import(&self, import_id: &str) {
        match self.cleanup.cleanup_import_directory(import_id).await {
            Ok(removed) => debug!(import_id, removed, "Import directory cleanup"),
            Err(e) => warn!(import_id, error = %e, "Import directory cleanup failed"),
        }
    }
}
