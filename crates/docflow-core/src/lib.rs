//! # docflow-core
//!
//! Core types, traits, and abstractions for the docflow document pipeline.
//!
//! This crate provides the data model and job state machine, the stage error
//! taxonomy, and the trait seams that the engine, the database layer and the
//! inference backends plug into.

pub mod defaults;
pub mod error;
pub mod events;
pub mod hashing;
pub mod logging;
pub mod models;
pub mod stage;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, PipelineEvent};
pub use hashing::{fingerprint_bytes, ContentHasher, Fingerprint};
pub use models::*;
pub use stage::{ErrorKind, FailureCategory, StageError, StageOutcome};
pub use traits::*;
pub use uuid_utils::{extract_timestamp, is_v7, new_v7};
