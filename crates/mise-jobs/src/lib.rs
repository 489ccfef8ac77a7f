//! # mise-jobs
//!
//! Background job processing for mise recipe imports.
//!
//! This crate provides:
//! - Per-note completion tracking across the note, instruction, ingredient
//!   and image workers, with a single terminal broadcast per note
//! - Action pipelines selected per job payload, built through a factory
//! - A priority job queue with retry accounting and concurrent workers
//! - Progress and lifecycle notifications via broadcast channels
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mise_jobs::{
//!     ActionDeps, ActionFactory, CompletionGuard, CompletionService, MemoryQueue,
//!     PipelineHandler, WorkerBuilder, WorkerConfig,
//! };
//!
//! let completion = Arc::new(CompletionService::new(notes, broadcaster.clone(), cleanup));
//! let deps = ActionDeps { completion: completion.clone(), guard, broadcaster, instructions, ingredients, images };
//! let queue = MemoryQueue::new();
//!
//! let mut builder = WorkerBuilder::new(Arc::new(queue.clone()))
//!     .with_config(WorkerConfig::from_env())
//!     .with_completion(completion);
//! for handler in PipelineHandler::for_all(Arc::new(ActionFactory::with_defaults()), deps) {
//!     builder = builder.with_handler(handler);
//! }
//! let handle = builder.build().await.start();
//!
//! queue.push(payload).await?;
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod action;
pub mod cleanup;
pub mod completion;
pub mod handler;
pub mod memory;
pub mod payload;
pub mod queue;
pub mod worker;

// Re-export core types
pub use mise_core::*;

pub use action::{
    Action, ActionContext, ActionDeps, ActionFactory, ActionName, Pipeline, PipelineFailure,
};
pub use cleanup::DirectoryCleanup;
pub use completion::{
    CompletionConfig, CompletionGuard, CompletionService, CompletionSweeper, CompletionTracker,
    MarkOutcome, NoteCompletionStatus, SweeperHandle,
};
pub use handler::{JobContext, JobHandler, JobResult, PipelineHandler};
pub use payload::{
    CompletionCheckJob, ImageJob, IngredientLineJob, InstructionLineJob, JobPayload,
    LineTracking, NoteJob,
};
pub use queue::{FailOutcome, Job, JobQueue, MemoryQueue, QueueStats};
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
