//! # docflow-jobs
//!
//! Document pipeline engine for docflow.
//!
//! This crate provides:
//! - The stage pipeline (extract, classify, optional embed, store)
//! - Three interchangeable schedulers: thread pool, cooperative, distributed
//! - Content-fingerprint deduplication and retry with exponential backoff
//! - Per-batch progress tracking with throughput/ETA and an event stream
//! - The remote worker that drains the distributed queue
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use docflow_inference::OllamaBackend;
//! use docflow_jobs::{EngineConfig, PipelineEngine};
//!
//! let ollama = Arc::new(OllamaBackend::from_env()?);
//! let engine = PipelineEngine::builder(EngineConfig::from_env()?)
//!     .with_classifier(ollama.clone())
//!     .with_embedder(ollama)
//!     .build()
//!     .await?;
//!
//! let handle = engine.submit_directory("./inbox", true, Some("upload-42".into())).await?;
//! let snapshot = engine.wait_for_batch(handle.batch_id).await?;
//! println!("{} succeeded, {} failed", snapshot.succeeded, snapshot.failed);
//!
//! engine.shutdown().await?;
//! ```

pub mod config;
pub mod engine;
pub mod extraction;
pub mod memory;
pub mod pipeline;
pub mod progress;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod worker;

// Re-export core types
pub use docflow_core::*;

pub use config::EngineConfig;
pub use engine::{collect_files, BatchHandle, EngineBuilder, JobHandle, PipelineEngine};
pub use extraction::{ExtractorRegistry, TextExtractor};
pub use memory::{MemoryDocumentStore, MemoryJobRepository, MemoryTaskQueue};
pub use pipeline::{Collaborators, PipelineRun, Stage, StagePipeline, StageResult};
pub use progress::{snapshot_from_repository, ProgressPublisher};
pub use rate_limit::ServiceLimiter;
pub use registry::BatchRegistry;
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{CrashOutcome, JobRunner};
pub use scheduler::{AsyncScheduler, BatchControl, DistributedScheduler, PoolScheduler, Scheduler};
pub use worker::{DistributedWorker, WorkerConfig, WorkerEvent, WorkerHandle};
