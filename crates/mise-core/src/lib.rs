//! # mise-core
//!
//! Core types, traits, and abstractions for the mise recipe importer.
//!
//! This crate provides the foundational data structures and collaborator
//! trait definitions that the job system and binaries depend on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, StatusEvent};
pub use logging::{init_tracing, LogFormat, LoggingConfig};
pub use models::*;
pub use traits::*;
