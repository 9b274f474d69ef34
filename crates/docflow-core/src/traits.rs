//! Core traits for docflow abstractions.
//!
//! Stage collaborators (extraction, classification, embedding, storage) and
//! the persistence seams (job repository, durable task queue) are defined
//! here so that schedulers and stages depend only on interfaces.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;
use crate::stage::StageOutcome;

// =============================================================================
// STAGE COLLABORATORS
// =============================================================================

/// Turns a job's source into text.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract content for `job`.
    async fn extract(&self, job: &Job) -> StageOutcome<ExtractedContent>;

    /// Extractor name for logging.
    fn name(&self) -> &str;
}

/// Assigns a category to extracted content.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, content: &ExtractedContent) -> StageOutcome<Classification>;

    /// Model or backend identifier.
    fn model_name(&self) -> &str;
}

/// Produces an embedding vector for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> StageOutcome<Vec<f32>>;

    /// Vector dimension; also the size of the fallback zero vector.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Persists the final document record.
///
/// Writes are keyed by job id, so a redelivered job overwrites rather than
/// duplicates.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn store(&self, record: &DocumentRecord) -> StageOutcome<()>;
}

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Job and batch state, shared by submitter, schedulers and workers.
///
/// `update` must be atomic per job: implementations load the job, run
/// [`Job::apply`] and write it back without interleaving another update.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a batch and all of its jobs.
    async fn create_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Apply a state-machine update to a job.
    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<AppliedUpdate>;

    /// Any job with this fingerprint that reached `Succeeded`.
    async fn find_succeeded_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>>;

    /// All jobs of a batch, in submission order.
    async fn list_for_batch(&self, batch_id: Uuid) -> Result<Vec<Job>>;

    /// Batch with counters computed from its jobs.
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>>;

    /// Times at which jobs of the batch finished processing (Succeeded or
    /// Failed), at or after `since`. Feeds throughput estimation.
    async fn processed_since(
        &self,
        batch_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;
}

// =============================================================================
// TASK QUEUE
// =============================================================================

/// A leased message from the task queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_id: Uuid,
    pub payload: TaskPayload,
    /// How many times this message has been handed out (1 on first delivery).
    pub delivery_count: i32,
}

/// Durable at-least-once queue used by the distributed scheduler.
///
/// A dequeued message is invisible for the lease duration. If it is neither
/// acked nor nacked before the lease expires it is delivered again.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Verify the broker is reachable.
    async fn health_check(&self) -> Result<()>;

    async fn enqueue(&self, payload: &TaskPayload) -> Result<Uuid>;

    /// Enqueue every payload before returning.
    ///
    /// At most `max_in_flight` messages of one batch are leased at a time;
    /// `dequeue` passes over the rest until a lease is released.
    async fn enqueue_batch(
        &self,
        payloads: &[TaskPayload],
        max_in_flight: usize,
    ) -> Result<Vec<Uuid>>;

    /// Claim the oldest visible message whose batch is under its lease limit.
    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>>;

    /// Drop a batch's messages that are not currently leased. Returns how
    /// many were removed.
    async fn purge_batch(&self, batch_id: Uuid) -> Result<u64>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery_id: Uuid) -> Result<()>;

    /// Return a delivered message to the queue, visible again after `delay`.
    async fn nack(&self, delivery_id: Uuid, delay: Duration) -> Result<()>;
}
