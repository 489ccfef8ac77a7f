//! Centralized default constants for the mise system.
//!
//! **This module is the single source of truth** for shared default values.
//! Config structs read their environment overrides on top of these.

// =============================================================================
// EVENTS
// =============================================================================

/// Buffer size of the status event bus and the worker event channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum retry count for failed jobs.
pub const JOB_MAX_RETRIES: u32 = 3;

/// Default job worker poll interval in milliseconds.
///
/// The in-memory queue wakes idle workers on enqueue, so this only bounds how
/// long a worker sleeps when nothing notifies it.
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum concurrent jobs per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default job execution timeout in seconds (5 minutes).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Finished jobs kept per outcome (completed, failed) for inspection.
pub const JOB_HISTORY_LIMIT: usize = 1000;

// =============================================================================
// COMPLETION TRACKING
// =============================================================================

/// Records not updated for this long are considered abandoned and evicted.
pub const COMPLETION_STALE_TTL_SECS: u64 = 3600;

/// How long a completed record stays queryable before the sweep removes it.
pub const COMPLETION_RETENTION_SECS: u64 = 300;

/// Interval between retention sweeps.
pub const COMPLETION_SWEEP_INTERVAL_SECS: u64 = 60;

/// Image upload progress is broadcast each time this percentage is crossed.
pub const IMAGE_PROGRESS_STEP_PERCENT: u32 = 25;

// =============================================================================
// INSTRUCTIONS
// =============================================================================

/// Formatted instructions shorter than this are stored but marked inactive.
pub const MIN_INSTRUCTION_LENGTH: usize = 3;

// =============================================================================
// FILES
// =============================================================================

/// Root directory holding per-import temporary working directories.
pub const IMPORT_WORK_DIR: &str = "./uploads/imports";
