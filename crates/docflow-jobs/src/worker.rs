//! Remote worker for the distributed scheduler.
//!
//! Claims deliveries from the durable queue, runs each job through the same
//! [`JobRunner`] the in-process schedulers use and acknowledges the delivery
//! only after the job's outcome is persisted. A worker that dies before
//! acking leaves the delivery to be redelivered when its lease expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use docflow_core::{defaults, logging, Delivery, Error, JobStatus, Result, TaskQueue};

use crate::runner::JobRunner;

/// Configuration for the distributed worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of deliveries processed concurrently.
    pub max_concurrent_jobs: usize,
    /// Visibility lease taken on each claimed delivery.
    pub lease_secs: u64,
    /// Whether to process jobs at all.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            lease_secs: defaults::JOB_LEASE_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    /// | `JOB_LEASE_SECS` | `600` | Delivery lease before redelivery |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let lease_secs = std::env::var("JOB_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_LEASE_SECS)
            .max(1);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            lease_secs,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_lease_secs(mut self, secs: u64) -> Self {
        self.lease_secs = secs.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the distributed worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    WorkerStarted,
    /// A delivery was claimed and its job is running.
    JobStarted { job_id: Uuid, delivery_count: i32 },
    /// The job reached a terminal state and the delivery was acked.
    JobFinished { job_id: Uuid, status: JobStatus },
    /// The delivery was returned to the queue without running to completion.
    JobRejected { job_id: Uuid, reason: String },
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to stop after its current deliveries.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Queue consumer that executes distributed jobs.
pub struct DistributedWorker {
    queue: Arc<dyn TaskQueue>,
    runner: JobRunner,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl DistributedWorker {
    pub fn new(queue: Arc<dyn TaskQueue>, runner: JobRunner, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            queue,
            runner,
            config,
            event_tx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker loop and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Claim up to `max_concurrent_jobs` deliveries, process them together,
    /// and only sleep when the queue is empty.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(subsystem = "worker", "Distributed worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            lease_secs = self.config.lease_secs,
            "Distributed worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let lease = Duration::from_secs(self.config.lease_secs);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(subsystem = "worker", "Distributed worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();
            for _ in 0..self.config.max_concurrent_jobs {
                match self.queue.dequeue(lease).await {
                    Ok(Some(delivery)) => {
                        claimed += 1;
                        let task = DeliveryTask {
                            queue: Arc::clone(&self.queue),
                            runner: self.runner.clone(),
                            event_tx: self.event_tx.clone(),
                            retry_delay: poll_interval,
                        };
                        tasks.spawn(task.execute(delivery));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(subsystem = "worker", error = %e, "Failed to claim delivery");
                        break;
                    }
                }
            }

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "worker", "Distributed worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!(subsystem = "worker", claimed, "Processing claimed deliveries");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(subsystem = "worker", error = ?e, "Delivery task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(subsystem = "worker", "Distributed worker stopped");
    }
}

/// What one spawned task needs to process a delivery.
struct DeliveryTask {
    queue: Arc<dyn TaskQueue>,
    runner: JobRunner,
    event_tx: broadcast::Sender<WorkerEvent>,
    retry_delay: Duration,
}

impl DeliveryTask {
    async fn execute(self, delivery: Delivery) {
        let start = Instant::now();
        let job_id = delivery.payload.job_id;

        if !delivery.payload.is_supported() {
            warn!(
                subsystem = "worker",
                job_id = %job_id,
                version = delivery.payload.version,
                "Unsupported payload version, returning delivery"
            );
            self.reject(&delivery, format!("unsupported payload version {}", delivery.payload.version))
                .await;
            return;
        }

        debug!(
            subsystem = "worker",
            job_id = %job_id,
            delivery_count = delivery.delivery_count,
            "Processing delivery"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            delivery_count: delivery.delivery_count,
        });

        match self.runner.run_isolated(job_id).await {
            Ok(status) => {
                self.ack(&delivery).await;
                info!(
                    subsystem = "worker",
                    job_id = %job_id,
                    %status,
                    duration_ms = logging::millis(start.elapsed()),
                    "Delivery processed"
                );
                let _ = self
                    .event_tx
                    .send(WorkerEvent::JobFinished { job_id, status });
            }
            Err(Error::JobNotFound(_)) => {
                warn!(
                    subsystem = "worker",
                    job_id = %job_id,
                    "Job no longer exists, dropping delivery"
                );
                self.ack(&delivery).await;
                let _ = self.event_tx.send(WorkerEvent::JobRejected {
                    job_id,
                    reason: "job not found".into(),
                });
            }
            Err(e) => {
                error!(
                    subsystem = "worker",
                    job_id = %job_id,
                    error = %e,
                    "Job could not be run, returning delivery"
                );
                self.reject(&delivery, e.to_string()).await;
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery.delivery_id).await {
            error!(
                subsystem = "worker",
                delivery_id = %delivery.delivery_id,
                error = %e,
                "Failed to ack delivery"
            );
        }
    }

    async fn reject(&self, delivery: &Delivery, reason: String) {
        if let Err(e) = self.queue.nack(delivery.delivery_id, self.retry_delay).await {
            error!(
                subsystem = "worker",
                delivery_id = %delivery.delivery_id,
                error = %e,
                "Failed to return delivery"
            );
        }
        let _ = self.event_tx.send(WorkerEvent::JobRejected {
            job_id: delivery.payload.job_id,
            reason,
        });
    }
}
