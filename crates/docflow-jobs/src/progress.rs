//! Progress publishing: turns job transitions into registry updates and
//! pipeline events, and answers snapshot queries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use docflow_core::{
    AppliedUpdate, Batch, Error, EventBus, EventEnvelope, Job, JobRepository, JobStatus,
    PipelineEvent, ProgressSnapshot, Result,
};

use crate::registry::{eta_for, rate_over, BatchRegistry};

/// Publishes job transitions to the [`BatchRegistry`] and the [`EventBus`].
#[derive(Clone)]
pub struct ProgressPublisher {
    registry: Arc<BatchRegistry>,
    events: Arc<EventBus>,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(Arc::new(BatchRegistry::default()), Arc::new(EventBus::default()))
    }
}

impl ProgressPublisher {
    pub fn new(registry: Arc<BatchRegistry>, events: Arc<EventBus>) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<BatchRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn register(&self, batch: &Batch, jobs: &[Job]) {
        self.registry.register(batch, jobs);
    }

    /// Record a persisted job update.
    ///
    /// Emits one `JobTransition` event, plus `BatchCompleted` when this was
    /// the batch's last job. Jobs of batches submitted elsewhere (a remote
    /// worker's view) are ignored.
    pub fn record(&self, applied: &AppliedUpdate) {
        let job = &applied.job;
        let recorded = match self
            .registry
            .record_transition(job.id, applied.previous, job.status)
        {
            Ok(recorded) => recorded,
            Err(Error::JobNotFound(_)) => return,
            Err(e) => {
                debug!(
                    subsystem = "engine",
                    component = "progress",
                    job_id = %job.id,
                    error = %e,
                    "Transition not recorded"
                );
                return;
            }
        };

        let error = match job.status {
            JobStatus::Retrying | JobStatus::Failed => job.last_error.clone(),
            _ => None,
        };
        let delivered = self.events.emit(
            PipelineEvent::JobTransition {
                batch_id: recorded.batch_id,
                job_id: job.id,
                from: recorded.from,
                to: job.status,
                attempt: job.attempt_count,
                error,
            },
            recorded.correlation_id.clone(),
        );
        if !delivered {
            debug!(
                subsystem = "engine",
                component = "progress",
                job_id = %job.id,
                to = %job.status,
                "No event subscribers, transition event dropped"
            );
        }

        if recorded.batch_completed {
            if let Some(snapshot) = self.registry.snapshot(recorded.batch_id) {
                info!(
                    subsystem = "engine",
                    component = "progress",
                    batch_id = %recorded.batch_id,
                    total = snapshot.total,
                    succeeded = snapshot.succeeded,
                    failed = snapshot.failed,
                    skipped = snapshot.skipped,
                    "Batch completed"
                );
                let delivered = self.events.emit(
                    PipelineEvent::BatchCompleted { snapshot },
                    recorded.correlation_id,
                );
                if !delivered {
                    debug!(
                        subsystem = "engine",
                        component = "progress",
                        batch_id = %recorded.batch_id,
                        "No event subscribers, completion event dropped"
                    );
                }
            }
        }
    }

    pub fn snapshot(&self, batch_id: Uuid) -> Option<ProgressSnapshot> {
        self.registry.snapshot(batch_id)
    }

    /// All pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Events of one batch. Events missed by a lagging consumer are dropped.
    pub fn subscribe_batch(
        &self,
        batch_id: Uuid,
    ) -> impl Stream<Item = EventEnvelope> + Send + Unpin + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(move |item| match item {
            Ok(envelope) if envelope.payload.batch_id() == batch_id => Some(envelope),
            Ok(_) => None,
            Err(lagged) => {
                debug!(
                    subsystem = "engine",
                    component = "progress",
                    batch_id = %batch_id,
                    error = %lagged,
                    "Batch subscriber lagged"
                );
                None
            }
        })
    }

    /// Wait until every job of the batch is terminal.
    pub async fn wait_for_completion(&self, batch_id: Uuid) -> Result<ProgressSnapshot> {
        let mut done = self
            .registry
            .completion(batch_id)
            .ok_or(Error::BatchNotFound(batch_id))?;
        done.wait_for(|complete| *complete)
            .await
            .map_err(|_| Error::Internal(format!("batch {batch_id} tracking dropped")))?;
        self.registry
            .snapshot(batch_id)
            .ok_or(Error::BatchNotFound(batch_id))
    }
}

/// Snapshot computed from the job repository alone.
///
/// Used when jobs are executed by other processes and the local registry
/// does not see their transitions.
pub async fn snapshot_from_repository(
    jobs: &dyn JobRepository,
    batch_id: Uuid,
    window: Duration,
) -> Result<ProgressSnapshot> {
    let batch = jobs
        .get_batch(batch_id)
        .await?
        .ok_or(Error::BatchNotFound(batch_id))?;

    let now = Utc::now();
    let window_start = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
    let since = window_start.max(batch.created_at);
    let processed = jobs.processed_since(batch_id, since).await?;
    let span = (now - since).to_std().unwrap_or(Duration::ZERO);

    let mut snapshot =
        ProgressSnapshot::from_counts(batch.batch_id, batch.correlation_id, batch.counts);
    snapshot.throughput_per_sec = rate_over(processed.len(), span);
    snapshot.eta = eta_for(snapshot.pending, snapshot.throughput_per_sec);
    Ok(snapshot)
}
