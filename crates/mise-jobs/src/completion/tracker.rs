//! In-memory completion state machine.
//!
//! One [`NoteCompletionStatus`] per note, keyed by note id in a [`DashMap`].
//! Every mutation of a record happens while holding that record's entry lock,
//! so the "not all done" to "all done" flip is observed by exactly one caller
//! even when workers finish concurrently.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

use mise_core::WorkerType;

/// Completion state of a single note.
///
/// Worker flags only ever go from `false` to `true`. `all_completed` is derived
/// from them and cannot be set directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteCompletionStatus {
    pub note_id: String,
    pub import_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_file_name: Option<String>,
    pub note_worker_completed: bool,
    pub instruction_worker_completed: bool,
    pub ingredient_worker_completed: bool,
    pub image_worker_completed: bool,
    all_completed: bool,
    pub total_image_jobs: u32,
    pub completed_image_jobs: u32,
    /// Set once the image total has been registered for this record.
    pub image_total_set: bool,
    pub total_ingredient_lines: u32,
    pub ingredient_total_set: bool,
    /// `"block:line"` keys of stored ingredient lines. Never larger than
    /// `total_ingredient_lines`.
    pub completed_ingredient_lines: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NoteCompletionStatus {
    pub fn new(
        note_id: impl Into<String>,
        import_id: impl Into<String>,
        html_file_name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            note_id: note_id.into(),
            import_id: import_id.into(),
            html_file_name,
            note_worker_completed: false,
            instruction_worker_completed: false,
            ingredient_worker_completed: false,
            image_worker_completed: false,
            all_completed: false,
            total_image_jobs: 0,
            completed_image_jobs: 0,
            image_total_set: false,
            total_ingredient_lines: 0,
            ingredient_total_set: false,
            completed_ingredient_lines: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// True once all four worker flags are set.
    pub fn all_completed(&self) -> bool {
        self.all_completed
    }

    pub fn is_worker_completed(&self, worker: WorkerType) -> bool {
        match worker {
            WorkerType::Note => self.note_worker_completed,
            WorkerType::Instruction => self.instruction_worker_completed,
            WorkerType::Ingredient => self.ingredient_worker_completed,
            WorkerType::Image => self.image_worker_completed,
        }
    }

    /// Worker types that have not reported completion yet.
    pub fn pending_workers(&self) -> Vec<WorkerType> {
        WorkerType::ALL
            .into_iter()
            .filter(|w| !self.is_worker_completed(*w))
            .collect()
    }

    pub fn ingredient_progress(&self) -> IngredientProgress {
        IngredientProgress::new(
            self.completed_ingredient_lines.len() as u32,
            self.total_ingredient_lines,
        )
    }

    fn set_worker_completed(&mut self, worker: WorkerType) {
        match worker {
            WorkerType::Note => self.note_worker_completed = true,
            WorkerType::Instruction => self.instruction_worker_completed = true,
            WorkerType::Ingredient => self.ingredient_worker_completed = true,
            WorkerType::Image => self.image_worker_completed = true,
        }
        self.all_completed = WorkerType::ALL
            .into_iter()
            .all(|w| self.is_worker_completed(w));
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Ingredient line progress for a note. Unknown notes report `0/0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngredientProgress {
    pub completed: u32,
    pub total: u32,
    /// `total > 0 && completed >= total`
    pub is_complete: bool,
}

impl IngredientProgress {
    pub fn new(completed: u32, total: u32) -> Self {
        Self {
            completed,
            total,
            is_complete: total > 0 && completed >= total,
        }
    }

    /// Client-facing `"completed/total"` label.
    pub fn label(&self) -> String {
        format!("{}/{}", self.completed, self.total)
    }
}

/// Result of recording one finished image job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProgress {
    pub completed: u32,
    pub total: u32,
    /// Progress step crossed by this job, in percent.
    pub milestone: Option<u32>,
    /// Every expected image has been uploaded (or none were expected).
    pub all_done: bool,
}

/// Result of marking a worker type complete.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    /// No record for the note.
    Unknown,
    /// Flag set; other workers are still pending.
    Partial { pending: Vec<WorkerType> },
    /// This call completed the note. Returned at most once per note.
    Completed(Box<NoteCompletionStatus>),
    /// The note had already completed before this call.
    AlreadyCompleted,
}

/// Result of [`CompletionTracker::fail`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailureClaim {
    /// The note already completed or failed; nothing changed.
    AlreadyFinished,
    /// The note is now failed. Carries the removed record, if one existed.
    Claimed(Option<Box<NoteCompletionStatus>>),
}

/// A record removed by [`CompletionTracker::evict_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedRecord {
    pub note_id: String,
    pub import_id: String,
    pub completed: bool,
    pub pending: Vec<WorkerType>,
}

/// Concurrent map of note completion records.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    records: DashMap<String, NoteCompletionStatus>,
    /// Notes whose completion already fired, with the time it fired.
    /// Survives re-initialization so a note never completes twice.
    fired: DashMap<String, DateTime<Utc>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) the record for a note with every flag cleared.
    pub fn initialize(&self, note_id: &str, import_id: &str, html_file_name: Option<String>) {
        let record = NoteCompletionStatus::new(note_id, import_id, html_file_name);
        if let Some(previous) = self.records.insert(note_id.to_string(), record) {
            warn!(
                note_id,
                previous_import_id = %previous.import_id,
                import_id,
                "Completion record re-initialized, previous progress discarded"
            );
        }
    }

    /// Set the expected image job count and reset the completed counter.
    ///
    /// Returns `false` for unknown notes.
    pub fn set_total_image_jobs(&self, note_id: &str, total: u32) -> bool {
        match self.records.get_mut(note_id) {
            Some(mut record) => {
                record.total_image_jobs = total;
                record.completed_image_jobs = 0;
                record.image_total_set = true;
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Set the expected ingredient line count. Returns `false` for unknown notes.
    ///
    /// Lines already recorded beyond a lowered total are dropped.
    pub fn set_total_ingredient_lines(&self, note_id: &str, total: u32) -> bool {
        match self.records.get_mut(note_id) {
            Some(mut record) => {
                record.total_ingredient_lines = total;
                record.ingredient_total_set = true;
                while record.completed_ingredient_lines.len() > total as usize {
                    if let Some(key) = record.completed_ingredient_lines.pop_last() {
                        warn!(note_id, key, total, "Dropped ingredient line beyond new total");
                    }
                }
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Count one finished image job.
    ///
    /// The counter never exceeds the total; extra reports are logged and only
    /// re-signal `all_done`. `step_percent` controls milestone granularity.
    pub fn record_image_job(&self, note_id: &str, step_percent: u32) -> Option<ImageProgress> {
        let mut record = self.records.get_mut(note_id)?;
        let total = record.total_image_jobs;
        let previous = record.completed_image_jobs;

        if previous >= total {
            if total > 0 {
                warn!(
                    note_id,
                    completed = previous,
                    total,
                    "Image job reported after all images completed"
                );
            }
            return Some(ImageProgress {
                completed: previous,
                total,
                milestone: None,
                all_done: true,
            });
        }

        let completed = previous + 1;
        record.completed_image_jobs = completed;
        record.touch();

        let step = step_percent.clamp(1, 100);
        let bucket = |done: u32| (u64::from(done) * 100 / u64::from(total)) as u32 / step;
        let milestone = (bucket(completed) > bucket(previous)).then(|| bucket(completed) * step);

        trace!(note_id, completed, total, ?milestone, "Image job recorded");

        Some(ImageProgress {
            completed,
            total,
            milestone,
            all_done: completed >= total,
        })
    }

    /// Record a stored ingredient line. Duplicate keys are ignored, and so are
    /// new keys once the set has reached the total.
    ///
    /// Returns the updated progress, or `None` for unknown notes.
    pub fn record_ingredient_line(
        &self,
        note_id: &str,
        block_index: u32,
        line_index: u32,
    ) -> Option<IngredientProgress> {
        let mut record = self.records.get_mut(note_id)?;
        let key = format!("{block_index}:{line_index}");
        let total = record.total_ingredient_lines;
        if record.completed_ingredient_lines.contains(&key) {
            trace!(note_id, block_index, line_index, "Ingredient line already recorded");
        } else if record.completed_ingredient_lines.len() >= total as usize {
            warn!(
                note_id,
                block_index,
                line_index,
                total,
                "Ingredient line reported beyond the expected total"
            );
        } else {
            record.completed_ingredient_lines.insert(key);
        }
        record.touch();
        Some(record.ingredient_progress())
    }

    /// Set a worker flag and detect the completion flip.
    pub fn mark_worker(&self, note_id: &str, worker: WorkerType) -> MarkOutcome {
        let Some(mut record) = self.records.get_mut(note_id) else {
            return MarkOutcome::Unknown;
        };

        let was_completed = record.all_completed();
        record.set_worker_completed(worker);

        if was_completed {
            return MarkOutcome::AlreadyCompleted;
        }
        if !record.all_completed() {
            return MarkOutcome::Partial {
                pending: record.pending_workers(),
            };
        }

        let now = Utc::now();
        if self.fired.insert(note_id.to_string(), now).is_some() {
            debug!(note_id, "Completion already fired for an earlier record");
            return MarkOutcome::AlreadyCompleted;
        }
        record.completed_at = Some(now);
        MarkOutcome::Completed(Box::new(record.clone()))
    }

    pub fn get(&self, note_id: &str) -> Option<NoteCompletionStatus> {
        self.records.get(note_id).map(|r| r.clone())
    }

    pub fn ingredient_progress(&self, note_id: &str) -> IngredientProgress {
        self.records
            .get(note_id)
            .map(|r| r.ingredient_progress())
            .unwrap_or_else(|| IngredientProgress::new(0, 0))
    }

    /// Drop a note's record. Returns the removed record.
    pub fn remove(&self, note_id: &str) -> Option<NoteCompletionStatus> {
        self.records.remove(note_id).map(|(_, record)| record)
    }

    /// Fail a note: drop its record and block any later completion.
    ///
    /// Runs under the record's entry lock, the same lock the completion flip
    /// takes, so a note either completes or fails, never both.
    pub fn fail(&self, note_id: &str) -> FailureClaim {
        let now = Utc::now();
        match self.records.entry(note_id.to_string()) {
            Entry::Occupied(entry) => {
                if self.fired.contains_key(note_id) {
                    return FailureClaim::AlreadyFinished;
                }
                self.fired.insert(note_id.to_string(), now);
                FailureClaim::Claimed(Some(Box::new(entry.remove())))
            }
            Entry::Vacant(_) => {
                if self.fired.contains_key(note_id) {
                    return FailureClaim::AlreadyFinished;
                }
                self.fired.insert(note_id.to_string(), now);
                FailureClaim::Claimed(None)
            }
        }
    }

    pub fn has_fired(&self, note_id: &str) -> bool {
        self.fired.contains_key(note_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evict completed records older than `retention` and incomplete records
    /// idle for longer than `stale_ttl`, measured against `now`. Fired markers
    /// older than `stale_ttl` are pruned too.
    pub fn evict_expired(
        &self,
        now: DateTime<Utc>,
        stale_ttl: Duration,
        retention: Duration,
    ) -> Vec<EvictedRecord> {
        let age = |at: DateTime<Utc>| (now - at).to_std().unwrap_or_default();
        let mut evicted = Vec::new();

        self.records.retain(|note_id, record| {
            let expired = if record.all_completed() {
                age(record.completed_at.unwrap_or(record.updated_at)) >= retention
            } else {
                age(record.updated_at) >= stale_ttl
            };
            if expired {
                evicted.push(EvictedRecord {
                    note_id: note_id.clone(),
                    import_id: record.import_id.clone(),
                    completed: record.all_completed(),
                    pending: record.pending_workers(),
                });
            }
            !expired
        });

        self.fired.retain(|_, fired_at| age(*fired_at) < stale_ttl);

        evicted
    }

    /// Drop every record and fired marker.
    pub fn clear(&self) {
        self.records.clear();
        self.fired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(note_id: &str) -> CompletionTracker {
        let tracker = CompletionTracker::new();
        tracker.initialize(note_id, "import-1", Some("pancakes.html".into()));
        tracker
    }

    #[test]
    fn test_initialize_creates_clean_record() {
        let tracker = tracker_with("n1");
        let record = tracker.get("n1").unwrap();
        assert_eq!(record.import_id, "import-1");
        assert_eq!(record.html_file_name.as_deref(), Some("pancakes.html"));
        assert!(!record.all_completed());
        assert_eq!(record.pending_workers().len(), 4);
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_flip_is_reported_once() {
        let tracker = tracker_with("n1");
        assert!(matches!(
            tracker.mark_worker("n1", WorkerType::Note),
            MarkOutcome::Partial { .. }
        ));
        tracker.mark_worker("n1", WorkerType::Instruction);
        tracker.mark_worker("n1", WorkerType::Ingredient);

        match tracker.mark_worker("n1", WorkerType::Image) {
            MarkOutcome::Completed(status) => {
                assert!(status.all_completed());
                assert!(status.completed_at.is_some());
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(
            tracker.mark_worker("n1", WorkerType::Image),
            MarkOutcome::AlreadyCompleted
        );
        assert_eq!(
            tracker.mark_worker("n1", WorkerType::Note),
            MarkOutcome::AlreadyCompleted
        );
    }

    #[test]
    fn test_partial_lists_pending_workers() {
        let tracker = tracker_with("n1");
        tracker.mark_worker("n1", WorkerType::Note);
        match tracker.mark_worker("n1", WorkerType::Image) {
            MarkOutcome::Partial { pending } => {
                assert_eq!(pending, vec![WorkerType::Instruction, WorkerType::Ingredient]);
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[test]
    fn test_reinitialized_note_does_not_fire_twice() {
        let tracker = tracker_with("n1");
        for worker in WorkerType::ALL {
            tracker.mark_worker("n1", worker);
        }
        assert!(tracker.has_fired("n1"));

        tracker.initialize("n1", "import-1", None);
        let mut outcomes = Vec::new();
        for worker in WorkerType::ALL {
            outcomes.push(tracker.mark_worker("n1", worker));
        }
        assert_eq!(outcomes.last(), Some(&MarkOutcome::AlreadyCompleted));
    }

    #[test]
    fn test_unknown_note_is_noop() {
        let tracker = CompletionTracker::new();
        assert_eq!(tracker.mark_worker("ghost", WorkerType::Note), MarkOutcome::Unknown);
        assert!(!tracker.set_total_image_jobs("ghost", 3));
        assert!(!tracker.set_total_ingredient_lines("ghost", 3));
        assert!(tracker.record_image_job("ghost", 25).is_none());
        assert!(tracker.record_ingredient_line("ghost", 0, 0).is_none());
        assert_eq!(tracker.ingredient_progress("ghost"), IngredientProgress::new(0, 0));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_image_milestones_every_quarter() {
        let tracker = tracker_with("n1");
        tracker.set_total_image_jobs("n1", 4);

        let milestones: Vec<_> = (0..4)
            .map(|_| tracker.record_image_job("n1", 25).unwrap().milestone)
            .collect();
        assert_eq!(milestones, vec![Some(25), Some(50), Some(75), Some(100)]);
    }

    #[test]
    fn test_image_milestones_skip_intermediate_jobs() {
        let tracker = tracker_with("n1");
        tracker.set_total_image_jobs("n1", 10);

        let hits: Vec<_> = (0..10)
            .filter_map(|_| tracker.record_image_job("n1", 25).unwrap().milestone)
            .collect();
        assert_eq!(hits, vec![25, 50, 75, 100]);
    }

    #[test]
    fn test_image_counter_is_capped() {
        let tracker = tracker_with("n1");
        tracker.set_total_image_jobs("n1", 1);

        let first = tracker.record_image_job("n1", 25).unwrap();
        assert!(first.all_done);
        assert_eq!(first.completed, 1);

        let extra = tracker.record_image_job("n1", 25).unwrap();
        assert!(extra.all_done);
        assert_eq!(extra.completed, 1);
        assert_eq!(extra.milestone, None);
        assert_eq!(tracker.get("n1").unwrap().completed_image_jobs, 1);
    }

    #[test]
    fn test_zero_image_total_is_immediately_done() {
        let tracker = tracker_with("n1");
        tracker.set_total_image_jobs("n1", 0);
        let progress = tracker.record_image_job("n1", 25).unwrap();
        assert!(progress.all_done);
        assert_eq!(progress.completed, 0);
    }

    #[test]
    fn test_set_total_resets_completed_images() {
        let tracker = tracker_with("n1");
        tracker.set_total_image_jobs("n1", 3);
        tracker.record_image_job("n1", 25);
        tracker.set_total_image_jobs("n1", 5);
        assert_eq!(tracker.get("n1").unwrap().completed_image_jobs, 0);
    }

    #[test]
    fn test_ingredient_lines_deduplicate() {
        let tracker = tracker_with("n1");
        tracker.set_total_ingredient_lines("n1", 3);
        tracker.record_ingredient_line("n1", 0, 0);
        tracker.record_ingredient_line("n1", 0, 0);
        tracker.record_ingredient_line("n1", 0, 1);

        let progress = tracker.ingredient_progress("n1");
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.label(), "2/3");
        assert!(!progress.is_complete);

        let done = tracker.record_ingredient_line("n1", 1, 0).unwrap();
        assert!(done.is_complete);
    }

    #[test]
    fn test_ingredient_lines_never_exceed_total() {
        let tracker = tracker_with("n1");
        tracker.set_total_ingredient_lines("n1", 1);
        tracker.record_ingredient_line("n1", 0, 0);
        let progress = tracker.record_ingredient_line("n1", 7, 9).unwrap();
        assert_eq!(progress.label(), "1/1");

        let record = tracker.get("n1").unwrap();
        assert!(record.completed_ingredient_lines.contains("0:0"));
        assert!(!record.completed_ingredient_lines.contains("7:9"));

        // Nothing is recorded before a total exists
        let fresh = tracker_with("n2");
        assert_eq!(fresh.record_ingredient_line("n2", 0, 0).unwrap().completed, 0);
    }

    #[test]
    fn test_lowering_ingredient_total_trims_lines() {
        let tracker = tracker_with("n1");
        tracker.set_total_ingredient_lines("n1", 3);
        for line in 0..3 {
            tracker.record_ingredient_line("n1", 0, line);
        }
        tracker.set_total_ingredient_lines("n1", 2);
        assert_eq!(tracker.ingredient_progress("n1").label(), "2/2");
    }

    #[test]
    fn test_totals_flags_track_registration() {
        let tracker = tracker_with("n1");
        let record = tracker.get("n1").unwrap();
        assert!(!record.image_total_set);
        assert!(!record.ingredient_total_set);

        tracker.set_total_image_jobs("n1", 0);
        tracker.set_total_ingredient_lines("n1", 4);
        let record = tracker.get("n1").unwrap();
        assert!(record.image_total_set);
        assert!(record.ingredient_total_set);
    }

    #[test]
    fn test_ingredient_progress_zero_total_is_not_complete() {
        let tracker = tracker_with("n1");
        assert!(!tracker.ingredient_progress("n1").is_complete);
    }

    #[test]
    fn test_fail_is_exclusive_with_completion() {
        let tracker = tracker_with("n1");
        for worker in WorkerType::ALL {
            tracker.mark_worker("n1", worker);
        }
        assert_eq!(tracker.fail("n1"), FailureClaim::AlreadyFinished);
        assert!(tracker.get("n1").unwrap().all_completed());

        let tracker = tracker_with("n2");
        assert!(matches!(tracker.fail("n2"), FailureClaim::Claimed(Some(_))));
        assert!(tracker.get("n2").is_none());
        assert_eq!(tracker.fail("n2"), FailureClaim::AlreadyFinished);

        assert_eq!(tracker.fail("ghost"), FailureClaim::Claimed(None));
        assert!(tracker.has_fired("ghost"));
    }

    #[test]
    fn test_remove_drops_record() {
        let tracker = tracker_with("n1");
        assert!(tracker.remove("n1").is_some());
        assert!(tracker.get("n1").is_none());
        assert!(tracker.remove("n1").is_none());
    }

    #[test]
    fn test_evict_expired_respects_ttls() {
        let tracker = CompletionTracker::new();
        tracker.initialize("stale", "i1", None);
        tracker.initialize("done", "i1", None);
        for worker in WorkerType::ALL {
            tracker.mark_worker("done", worker);
        }

        let now = Utc::now();
        let none = tracker.evict_expired(now, Duration::from_secs(60), Duration::from_secs(30));
        assert!(none.is_empty());
        assert_eq!(tracker.len(), 2);

        let later = now + chrono::Duration::seconds(45);
        let evicted = tracker.evict_expired(later, Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].note_id, "done");
        assert!(evicted[0].completed);

        let much_later = now + chrono::Duration::seconds(120);
        let evicted =
            tracker.evict_expired(much_later, Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].note_id, "stale");
        assert!(!evicted[0].completed);
        assert_eq!(evicted[0].pending.len(), 4);
        assert!(!tracker.has_fired("done"));
    }

    #[test]
    fn test_status_serializes_all_completed() {
        let tracker = tracker_with("n1");
        let json = serde_json::to_value(tracker.get("n1").unwrap()).unwrap();
        assert_eq!(json["all_completed"], false);
        assert_eq!(json["note_worker_completed"], false);
        assert!(json.get("completed_at").is_none());
    }
}
