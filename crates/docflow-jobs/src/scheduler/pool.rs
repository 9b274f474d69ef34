//! Worker-thread pool scheduler.
//!
//! N OS threads, each with its own single-threaded runtime, pull chunks of
//! up to C jobs from a shared channel. Runtimes are built before their
//! thread is spawned, so a pool that starts has all N workers. A worker that panics mid-chunk exits;
//! the supervisor thread runs crash recovery for the job it held, requeues
//! the chunk's unstarted jobs and spawns a replacement worker.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use docflow_core::{Error, Job, JobStatus, ProgressSnapshot, Result, Strategy};

use super::{BatchControl, Scheduler};
use crate::runner::{panic_message, CrashOutcome, JobRunner};

/// How long an idle worker blocks on the queue before rechecking shutdown.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Dispatch {
    job_id: Uuid,
    batch_id: Uuid,
    /// Job was mid-attempt when its worker died; runs even if cancelled.
    resumed: bool,
}

enum WorkerExit {
    Stopped {
        worker_id: usize,
    },
    Crashed {
        worker_id: usize,
        in_flight: Dispatch,
        unstarted: Vec<Dispatch>,
        message: String,
    },
}

struct PoolShared {
    runner: JobRunner,
    control: BatchControl,
    queue_tx: Sender<Dispatch>,
    queue_rx: Receiver<Dispatch>,
    exit_tx: Sender<WorkerExit>,
    shutdown: AtomicBool,
    chunk_size: usize,
    /// Worker threads spawned and not yet exited.
    live: AtomicUsize,
}

/// Thread-pool [`Scheduler`].
pub struct PoolScheduler {
    shared: Arc<PoolShared>,
    workers: usize,
    poll_interval: Duration,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn current_thread_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

impl PoolScheduler {
    /// Spawn `workers` threads and the supervisor.
    ///
    /// Fails with [`Error::WorkerPool`] if any thread or runtime cannot be
    /// created; no jobs are accepted in that case.
    pub fn start(
        runner: JobRunner,
        workers: usize,
        chunk_size: usize,
        poll_interval: Duration,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(Error::WorkerPool("pool needs at least one worker".into()));
        }
        let (queue_tx, queue_rx) = channel::unbounded();
        let (exit_tx, exit_rx) = channel::unbounded();
        let shared = Arc::new(PoolShared {
            runner,
            control: BatchControl::new(),
            queue_tx,
            queue_rx,
            exit_tx,
            shutdown: AtomicBool::new(false),
            chunk_size: chunk_size.max(1),
            live: AtomicUsize::new(0),
        });

        let supervisor_rt = current_thread_runtime()
            .map_err(|e| Error::WorkerPool(format!("supervisor runtime: {e}")))?;

        for worker_id in 0..workers {
            if let Err(e) = spawn_worker(&shared, worker_id) {
                shared.shutdown.store(true, Ordering::SeqCst);
                return Err(Error::WorkerPool(format!(
                    "cannot spawn worker {worker_id}: {e}"
                )));
            }
        }

        let supervisor_shared = Arc::clone(&shared);
        let supervisor = thread::Builder::new()
            .name("docflow-pool-supervisor".into())
            .spawn(move || supervise(supervisor_shared, supervisor_rt, exit_rx))
            .map_err(|e| {
                shared.shutdown.store(true, Ordering::SeqCst);
                Error::WorkerPool(format!("cannot spawn supervisor: {e}"))
            })?;

        info!(
            subsystem = "scheduler",
            component = "pool",
            workers,
            chunk_size = shared.chunk_size,
            "Pool scheduler started"
        );

        Ok(Self {
            shared,
            workers,
            poll_interval,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Worker threads currently running. Drops only briefly while a crashed
    /// worker is replaced.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the shared queue.
    pub fn queued(&self) -> usize {
        self.shared.queue_rx.len()
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, worker_id: usize) -> std::io::Result<JoinHandle<()>> {
    let rt = current_thread_runtime()?;
    shared.live.fetch_add(1, Ordering::SeqCst);
    let worker_shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("docflow-pool-{worker_id}"))
        .spawn(move || worker_loop(worker_shared, worker_id, rt))
        .inspect_err(|_| {
            shared.live.fetch_sub(1, Ordering::SeqCst);
        })
}

fn next_chunk(shared: &PoolShared) -> Vec<Dispatch> {
    let first = match shared.queue_rx.recv_timeout(WORKER_IDLE_WAIT) {
        Ok(dispatch) => dispatch,
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return Vec::new(),
    };
    let mut chunk = Vec::with_capacity(shared.chunk_size);
    chunk.push(first);
    while chunk.len() < shared.chunk_size {
        match shared.queue_rx.try_recv() {
            Ok(dispatch) => chunk.push(dispatch),
            Err(_) => break,
        }
    }
    chunk
}

fn worker_loop(shared: Arc<PoolShared>, worker_id: usize, rt: Runtime) {
    debug!(subsystem = "scheduler", component = "pool", worker_id, "Pool worker started");

    while !shared.shutdown.load(Ordering::SeqCst) {
        let mut chunk: VecDeque<Dispatch> = next_chunk(&shared).into();
        if !chunk.is_empty() {
            trace!(worker_id, chunk = chunk.len(), "Pulled chunk");
        }

        while let Some(dispatch) = chunk.pop_front() {
            if shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let token = if dispatch.resumed {
                Some(shared.control.begin_resumed(dispatch.batch_id))
            } else {
                shared.control.try_begin(dispatch.batch_id)
            };
            let Some(_token) = token else {
                debug!(
                    subsystem = "scheduler",
                    component = "pool",
                    job_id = %dispatch.job_id,
                    batch_id = %dispatch.batch_id,
                    "Batch cancelled, job left pending"
                );
                continue;
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                rt.block_on(shared.runner.run(dispatch.job_id))
            }));
            match outcome {
                Ok(Ok(status)) => {
                    trace!(worker_id, job_id = %dispatch.job_id, %status, "Job finished");
                }
                Ok(Err(e)) => {
                    error!(
                        subsystem = "scheduler",
                        component = "pool",
                        worker_id,
                        job_id = %dispatch.job_id,
                        error = %e,
                        "Job could not be run"
                    );
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let _ = shared.exit_tx.send(WorkerExit::Crashed {
                        worker_id,
                        in_flight: dispatch,
                        unstarted: chunk.into_iter().collect(),
                        message,
                    });
                    return;
                }
            }
        }
    }

    debug!(subsystem = "scheduler", component = "pool", worker_id, "Pool worker stopped");
    let _ = shared.exit_tx.send(WorkerExit::Stopped { worker_id });
}

fn supervise(shared: Arc<PoolShared>, rt: Runtime, exits: Receiver<WorkerExit>) {
    while shared.live.load(Ordering::SeqCst) > 0 {
        let Ok(exit) = exits.recv() else {
            break;
        };
        shared.live.fetch_sub(1, Ordering::SeqCst);

        let WorkerExit::Crashed {
            worker_id,
            in_flight,
            unstarted,
            message,
        } = exit
        else {
            continue;
        };

        warn!(
            subsystem = "scheduler",
            component = "pool",
            worker_id,
            job_id = %in_flight.job_id,
            requeued = unstarted.len(),
            error = %message,
            "Pool worker crashed"
        );

        match rt.block_on(shared.runner.handle_crash(in_flight.job_id, &message)) {
            Ok(CrashOutcome::Requeued) => {
                let _ = shared.queue_tx.send(Dispatch {
                    resumed: true,
                    ..in_flight
                });
            }
            Ok(CrashOutcome::Failed) | Ok(CrashOutcome::Finished(_)) => {}
            Err(e) => {
                error!(
                    subsystem = "scheduler",
                    component = "pool",
                    job_id = %in_flight.job_id,
                    error = %e,
                    "Crash recovery failed"
                );
            }
        }
        for dispatch in unstarted {
            let _ = shared.queue_tx.send(dispatch);
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(e) = spawn_worker(&shared, worker_id) {
            error!(
                subsystem = "scheduler",
                component = "pool",
                worker_id,
                error = %e,
                "Cannot respawn pool worker"
            );
        }
    }
    debug!(subsystem = "scheduler", component = "pool", "Pool supervisor stopped");
}

#[async_trait]
impl Scheduler for PoolScheduler {
    fn strategy(&self) -> Strategy {
        Strategy::Pool
    }

    async fn submit(&self, batch_id: Uuid, jobs: &[Job]) -> Result<usize> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::WorkerPool("pool is shut down".into()));
        }
        let pending: Vec<&Job> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        self.shared.control.admit(batch_id, pending.len());
        let mut accepted = 0;
        for job in &pending {
            let sent = self.shared.queue_tx.send(Dispatch {
                job_id: job.id,
                batch_id,
                resumed: false,
            });
            if sent.is_err() {
                self.shared
                    .control
                    .release(batch_id, pending.len() - accepted);
                return Err(Error::WorkerPool("pool queue closed".into()));
            }
            accepted += 1;
        }
        debug!(
            subsystem = "scheduler",
            component = "pool",
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
                component = "pool",
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
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| Error::Internal(format!("pool shutdown: {e}")))?
                .map_err(|_| Error::Internal("pool supervisor panicked".into()))?;
            info!(subsystem = "scheduler", component = "pool", "Pool scheduler stopped");
        }
        Ok(())
    }
}

impl Drop for PoolScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }
}
