//! Per-note completion tracking across the four worker types.
//!
//! - [`CompletionTracker`]: the in-memory state machine (flags, sub-counters,
//!   flip detection). Purely synchronous.
//! - [`CompletionService`]: the public surface workers call; owns the side
//!   effects fired when a note finishes or fails.
//! - [`CompletionGuard`]: per-worker duplicate-broadcast guard used by the
//!   completion-check actions.
//! - [`CompletionSweeper`]: background TTL/retention sweep.

mod guard;
mod service;
mod sweeper;
mod tracker;

use std::time::Duration;

pub use guard::CompletionGuard;
pub use service::CompletionService;
pub use sweeper::{CompletionSweeper, SweeperHandle};
pub use tracker::{
    CompletionTracker, EvictedRecord, FailureClaim, ImageProgress, IngredientProgress,
    MarkOutcome, NoteCompletionStatus,
};

use mise_core::defaults;

/// Configuration for completion tracking.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Incomplete records idle for longer than this are evicted.
    pub stale_ttl: Duration,
    /// Completed records stay queryable for this long.
    pub retention: Duration,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
    /// Image progress broadcast granularity in percent (1..=100).
    pub image_progress_step_percent: u32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            stale_ttl: Duration::from_secs(defaults::COMPLETION_STALE_TTL_SECS),
            retention: Duration::from_secs(defaults::COMPLETION_RETENTION_SECS),
            sweep_interval: Duration::from_secs(defaults::COMPLETION_SWEEP_INTERVAL_SECS),
            image_progress_step_percent: defaults::IMAGE_PROGRESS_STEP_PERCENT,
        }
    }
}

impl CompletionConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `COMPLETION_STALE_TTL_SECS` | `3600` | Evict incomplete notes idle this long |
    /// | `COMPLETION_RETENTION_SECS` | `300` | Keep completed notes this long |
    /// | `COMPLETION_SWEEP_INTERVAL_SECS` | `60` | Sweep interval |
    /// | `IMAGE_PROGRESS_STEP_PERCENT` | `25` | Image progress broadcast step |
    pub fn from_env() -> Self {
        fn secs(var: &str, default: u64) -> Duration {
            let value = std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default);
            Duration::from_secs(value)
        }

        let image_progress_step_percent = std::env::var("IMAGE_PROGRESS_STEP_PERCENT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::IMAGE_PROGRESS_STEP_PERCENT)
            .clamp(1, 100);

        Self {
            stale_ttl: secs(
                "COMPLETION_STALE_TTL_SECS",
                defaults::COMPLETION_STALE_TTL_SECS,
            ),
            retention: secs(
                "COMPLETION_RETENTION_SECS",
                defaults::COMPLETION_RETENTION_SECS,
            ),
            sweep_interval: secs(
                "COMPLETION_SWEEP_INTERVAL_SECS",
                defaults::COMPLETION_SWEEP_INTERVAL_SECS,
            )
            .max(Duration::from_secs(1)),
            image_progress_step_percent,
        }
    }

    pub fn with_stale_ttl(mut self, ttl: Duration) -> Self {
        self.stale_ttl = ttl;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_image_progress_step(mut self, percent: u32) -> Self {
        self.image_progress_step_percent = percent.clamp(1, 100);
        self
    }
}
