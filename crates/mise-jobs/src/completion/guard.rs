use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use mise_core::WorkerType;

/// Remembers which (worker type, note) pairs already broadcast their
/// per-worker completion message.
///
/// Shared by every completion-check action. The first check for a pair claims
/// it; later checks see it claimed and skip the broadcast.
#[derive(Debug, Default)]
pub struct CompletionGuard {
    claimed: DashMap<(WorkerType, String), DateTime<Utc>>,
}

impl CompletionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pair. Returns `true` only for the first caller.
    pub fn claim(&self, worker: WorkerType, note_id: &str) -> bool {
        self.claimed
            .insert((worker, note_id.to_string()), Utc::now())
            .is_none()
    }

    pub fn is_claimed(&self, worker: WorkerType, note_id: &str) -> bool {
        self.claimed.contains_key(&(worker, note_id.to_string()))
    }

    /// Give a claim back, so the next check for the pair may claim it.
    pub fn release(&self, worker: WorkerType, note_id: &str) {
        self.claimed.remove(&(worker, note_id.to_string()));
    }

    /// Drop claims older than `max_age`. Returns how many were dropped.
    pub fn prune(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let before = self.claimed.len();
        self.claimed
            .retain(|_, at| (now - *at).to_std().unwrap_or_default() < max_age);
        before.saturating_sub(self.claimed.len())
    }

    /// Forget all claims.
    pub fn reset(&self) {
        self.claimed.clear();
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}
