//! Distributed scheduler: jobs go onto a durable queue and are executed by
//! [`crate::DistributedWorker`]s, possibly on other machines.
//!
//! The submitter holds no job state. Every accepted job is on the queue by
//! the time `submit` returns; the per-batch in-flight bound travels with the
//! messages and is enforced when workers claim them. Progress is read back
//! from the job repository, which the workers write to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use docflow_core::{
    Error, Job, JobRepository, JobStatus, ProgressSnapshot, Result, Strategy, TaskPayload,
    TaskQueue,
};

use super::{BatchControl, Scheduler};
use crate::progress::snapshot_from_repository;

/// Durable-queue [`Scheduler`].
pub struct DistributedScheduler {
    queue: Arc<dyn TaskQueue>,
    jobs: Arc<dyn JobRepository>,
    control: BatchControl,
    shutdown: AtomicBool,
    max_in_flight: usize,
    poll_interval: Duration,
    throughput_window: Duration,
}

impl DistributedScheduler {
    /// Connect to the queue.
    ///
    /// Fails with [`Error::QueueUnavailable`] when the queue does not answer
    /// its health check; nothing is accepted in that case.
    pub async fn connect(
        queue: Arc<dyn TaskQueue>,
        jobs: Arc<dyn JobRepository>,
        max_in_flight: usize,
        poll_interval: Duration,
        throughput_window: Duration,
    ) -> Result<Self> {
        queue.health_check().await.map_err(|e| match e {
            Error::QueueUnavailable(msg) => Error::QueueUnavailable(msg),
            other => Error::QueueUnavailable(other.to_string()),
        })?;

        info!(
            subsystem = "scheduler",
            component = "distributed",
            max_in_flight,
            "Distributed scheduler connected"
        );

        Ok(Self {
            queue,
            jobs,
            control: BatchControl::new(),
            shutdown: AtomicBool::new(false),
            max_in_flight: max_in_flight.max(1),
            poll_interval,
            throughput_window,
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }
}

#[async_trait]
impl Scheduler for DistributedScheduler {
    fn strategy(&self) -> Strategy {
        Strategy::Distributed
    }

    async fn submit(&self, batch_id: Uuid, jobs: &[Job]) -> Result<usize> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::QueueUnavailable("scheduler is shut down".into()));
        }
        let payloads: Vec<TaskPayload> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(TaskPayload::for_job)
            .collect();
        if payloads.is_empty() {
            return Ok(0);
        }

        self.queue
            .enqueue_batch(&payloads, self.max_in_flight)
            .await
            .map_err(|e| match e {
                Error::QueueUnavailable(msg) => Error::QueueUnavailable(msg),
                other => Error::QueueUnavailable(other.to_string()),
            })?;

        debug!(
            subsystem = "scheduler",
            component = "distributed",
            batch_id = %batch_id,
            job_count = payloads.len(),
            max_in_flight = self.max_in_flight,
            "Jobs enqueued"
        );
        Ok(payloads.len())
    }

    /// Removes the batch's unclaimed messages. Deliveries a worker is
    /// already processing run to completion.
    async fn cancel(&self, batch_id: Uuid) -> Result<()> {
        if !self.control.cancel(batch_id) {
            return Ok(());
        }
        match self.queue.purge_batch(batch_id).await {
            Ok(purged) => {
                info!(
                    subsystem = "scheduler",
                    component = "distributed",
                    batch_id = %batch_id,
                    purged,
                    "Batch cancelled"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    subsystem = "scheduler",
                    component = "distributed",
                    batch_id = %batch_id,
                    error = %e,
                    "Cannot purge cancelled batch"
                );
                Err(e)
            }
        }
    }

    async fn progress(&self, batch_id: Uuid) -> Result<ProgressSnapshot> {
        snapshot_from_repository(self.jobs.as_ref(), batch_id, self.throughput_window).await
    }

    /// Remote work cannot be observed here, so a cancelled batch counts as
    /// settled straight away.
    fn is_settled(&self, batch_id: Uuid) -> bool {
        self.control.is_cancelled(batch_id)
    }

    fn forget(&self, batch_id: Uuid) -> bool {
        self.control.forget(batch_id)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Nothing is held locally; queued messages stay for the workers.
    async fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        info!(subsystem = "scheduler", component = "distributed", "Distributed scheduler stopped");
        Ok(())
    }
}
