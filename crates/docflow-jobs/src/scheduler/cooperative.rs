//! Cooperative scheduler: one OS thread, bounded in-flight jobs.
//!
//! Jobs run as tasks on a dedicated current-thread runtime and yield at
//! every I/O await, so while one job waits on the AI service another makes
//! progress. A semaphore caps how many jobs are in flight at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info};
use uuid::Uuid;

use docflow_core::{Error, Job, JobStatus, ProgressSnapshot, Result, Strategy};

use super::{BatchControl, Scheduler};
use crate::runner::JobRunner;

struct AsyncShared {
    runner: JobRunner,
    control: BatchControl,
    slots: Arc<Semaphore>,
    shutdown: AtomicBool,
}

/// Single-threaded cooperative [`Scheduler`].
pub struct AsyncScheduler {
    shared: Arc<AsyncShared>,
    handle: Handle,
    max_concurrent: usize,
    poll_interval: Duration,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncScheduler {
    /// Start the scheduler thread and its runtime.
    pub fn start(runner: JobRunner, max_concurrent: usize, poll_interval: Duration) -> Result<Self> {
        let max_concurrent = max_concurrent.max(1);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::WorkerPool(format!("cooperative runtime: {e}")))?;
        let handle = rt.handle().clone();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("docflow-async".into())
            .spawn(move || {
                rt.block_on(async {
                    let _ = stop_rx.await;
                });
            })
            .map_err(|e| Error::WorkerPool(format!("cannot spawn scheduler thread: {e}")))?;

        info!(
            subsystem = "scheduler",
            component = "cooperative",
            max_concurrent,
            "Async scheduler started"
        );

        Ok(Self {
            shared: Arc::new(AsyncShared {
                runner,
                control: BatchControl::new(),
                slots: Arc::new(Semaphore::new(max_concurrent)),
                shutdown: AtomicBool::new(false),
            }),
            handle,
            max_concurrent,
            poll_interval,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Jobs currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.shared.slots.available_permits()
    }
}

/// Dispatch a batch's jobs one slot at a time.
///
/// The cancel check happens after a slot is acquired, so a batch cancelled
/// while its feeder waits dispatches nothing further.
async fn feed(shared: Arc<AsyncShared>, batch_id: Uuid, job_ids: Vec<Uuid>) {
    let total = job_ids.len();
    for (dispatched, job_id) in job_ids.into_iter().enumerate() {
        let Ok(permit) = Arc::clone(&shared.slots).acquire_owned().await else {
            return;
        };
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let Some(token) = shared.control.try_begin(batch_id) else {
            shared.control.release(batch_id, total - dispatched - 1);
            debug!(
                subsystem = "scheduler",
                component = "cooperative",
                batch_id = %batch_id,
                dispatched,
                undispatched = total - dispatched,
                "Batch cancelled, feeder stopped"
            );
            return;
        };

        let runner = shared.runner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _token = token;
            if let Err(e) = runner.run_isolated(job_id).await {
                error!(
                    subsystem = "scheduler",
                    component = "cooperative",
                    job_id = %job_id,
                    error = %e,
                    "Job could not be run"
                );
            }
        });
    }
}

#[async_trait]
impl Scheduler for AsyncScheduler {
    fn strategy(&self) -> Strategy {
        Strategy::Async
    }

    async fn submit(&self, batch_id: Uuid, jobs: &[Job]) -> Result<usize> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::WorkerPool("scheduler is shut down".into()));
        }
        let job_ids: Vec<Uuid> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();
        let accepted = job_ids.len();
        self.shared.control.admit(batch_id, accepted);
        self.handle
            .spawn(feed(Arc::clone(&self.shared), batch_id, job_ids));
        debug!(
            subsystem = "scheduler",
            component = "cooperative",
            batch_id = %batch_id,
            job_count = accepted,
            "Jobs queued"
        );
        Ok(accepted)
    }

    async fn cancel(&self, batch_id: Uuid) -> Result<()> {
        if self.shared.control.cancel(batch_id) {
            info!(
                subsystem = "scheduler",
                component = "cooperative",
                batch_id = %batch_id,
                in_flight = self.shared.control.in_flight(batch_id),
                "Batch cancelled"
            );
        }
        Ok(())
    }

    async fn progress(&self, batch_id: Uuid) -> Result<ProgressSnapshot> {
        self.shared
            .runner
            .publisher()
            .snapshot(batch_id)
            .ok_or(Error::BatchNotFound(batch_id))
    }

    fn is_settled(&self, batch_id: Uuid) -> bool {
        self.shared.control.is_cancelled(batch_id)
            && self.shared.control.in_flight(batch_id) == 0
            && !self
                .shared
                .runner
                .publisher()
                .registry()
                .has_active_jobs(batch_id)
    }

    fn forget(&self, batch_id: Uuid) -> bool {
        self.shared.control.forget(batch_id)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Semaphore is fair: waiting feeders are served first, see the flag
        // and exit; running jobs finish and release their slots.
        let drained = self
            .shared
            .slots
            .acquire_many(self.max_concurrent as u32)
            .await
            .map_err(|e| Error::Internal(format!("cooperative drain: {e}")))?;
        drop(drained);

        if let Some(stop) = self.stop_tx.lock().take() {
            let _ = stop.send(());
        }
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| Error::Internal(format!("cooperative shutdown: {e}")))?
                .map_err(|_| Error::Internal("cooperative scheduler thread panicked".into()))?;
        }
        info!(subsystem = "scheduler", component = "cooperative", "Async scheduler stopped");
        Ok(())
    }
}
