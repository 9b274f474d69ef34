//! Runs one job to a terminal state: dedup guard, pipeline attempts, retry
//! decisions and crash recovery. Every scheduler executes jobs through a
//! [`JobRunner`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use docflow_core::{logging, Error, JobRepository, JobStatus, JobUpdate, Result, StageError};

use crate::pipeline::{StageFailure, StagePipeline};
use crate::progress::ProgressPublisher;
use crate::retry::{RetryDecision, RetryPolicy};

/// What crash recovery did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashOutcome {
    /// Attempts remain; the job is Retrying (or still Pending) and must be
    /// dispatched again.
    Requeued,
    /// Attempts exhausted; the job is Failed with a worker-crash error.
    Failed,
    /// The job was already terminal.
    Finished(JobStatus),
}

/// Executes jobs through the pipeline and records every transition.
#[derive(Clone)]
pub struct JobRunner {
    pipeline: Arc<StagePipeline>,
    jobs: Arc<dyn JobRepository>,
    retry: RetryPolicy,
    publisher: ProgressPublisher,
}

impl JobRunner {
    pub fn new(
        pipeline: Arc<StagePipeline>,
        jobs: Arc<dyn JobRepository>,
        retry: RetryPolicy,
        publisher: ProgressPublisher,
    ) -> Self {
        Self {
            pipeline,
            jobs,
            retry,
            publisher,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobRepository> {
        &self.jobs
    }

    pub fn publisher(&self) -> &ProgressPublisher {
        &self.publisher
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn pipeline(&self) -> &Arc<StagePipeline> {
        &self.pipeline
    }

    async fn apply(&self, job_id: Uuid, update: JobUpdate) -> Result<docflow_core::Job> {
        let applied = self.jobs.update(job_id, update).await?;
        self.publisher.record(&applied);
        Ok(applied.job)
    }

    /// Run a job until it is terminal and return its final status.
    ///
    /// Terminal jobs are returned untouched. A pending job whose fingerprint
    /// already succeeded elsewhere is skipped unless it was forced. A job
    /// found Running was abandoned by a previous owner and goes through
    /// crash recovery first.
    pub async fn run(&self, job_id: Uuid) -> Result<JobStatus> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        if job.is_terminal() {
            debug!(
                subsystem = "worker",
                job_id = %job_id,
                status = %job.status,
                "Job already terminal, not re-running"
            );
            return Ok(job.status);
        }

        if job.status == JobStatus::Pending && !job.force {
            if let Some(existing) = self.jobs.find_succeeded_by_hash(&job.content_hash).await? {
                if existing != job_id {
                    debug!(
                        subsystem = "worker",
                        job_id = %job_id,
                        duplicate_of = %existing,
                        "Fingerprint already processed, skipping"
                    );
                    self.apply(
                        job_id,
                        JobUpdate::Skip {
                            duplicate_of: Some(existing),
                        },
                    )
                    .await?;
                    return Ok(JobStatus::Skipped);
                }
            }
        }

        if job.status == JobStatus::Running {
            match self
                .handle_crash(job_id, "previous owner stopped mid-attempt")
                .await?
            {
                CrashOutcome::Requeued => {}
                CrashOutcome::Failed => return Ok(JobStatus::Failed),
                CrashOutcome::Finished(status) => return Ok(status),
            }
        }

        let started = Instant::now();
        loop {
            let job = self.apply(job_id, JobUpdate::Start).await?;
            let run = self.pipeline.run(&job).await;
            let stage_index = run.last_stage_index();

            match run.outcome {
                Ok(result) => {
                    self.apply(
                        job_id,
                        JobUpdate::Succeed {
                            stage_index,
                            result,
                        },
                    )
                    .await?;
                    info!(
                        subsystem = "worker",
                        job_id = %job_id,
                        batch_id = %job.batch_id,
                        attempt = job.attempt_count,
                        duration_ms = logging::millis(started.elapsed()),
                        "Job succeeded"
                    );
                    return Ok(JobStatus::Succeeded);
                }
                Err(StageFailure { stage_index, error }) => {
                    match self.retry.decide(error.kind, job.attempt_count) {
                        RetryDecision::Retry(delay) => {
                            warn!(
                                subsystem = "worker",
                                job_id = %job_id,
                                attempt = job.attempt_count,
                                stage = error.stage.as_deref().unwrap_or("unknown"),
                                delay_ms = logging::millis(delay),
                                error = %error,
                                "Attempt failed, retry scheduled"
                            );
                            self.apply(job_id, JobUpdate::Retry { stage_index, error })
                                .await?;
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            warn!(
                                subsystem = "worker",
                                job_id = %job_id,
                                batch_id = %job.batch_id,
                                attempt = job.attempt_count,
                                stage = error.stage.as_deref().unwrap_or("unknown"),
                                error = %error,
                                "Job failed"
                            );
                            self.apply(job_id, JobUpdate::Fail { stage_index, error })
                                .await?;
                            return Ok(JobStatus::Failed);
                        }
                    }
                }
            }
        }
    }

    /// Recover a job whose execution unit died.
    ///
    /// A job caught mid-attempt is moved to Retrying with a worker-crash
    /// error while attempts remain, otherwise Failed. A job that never
    /// started is left Pending and only needs dispatching again.
    pub async fn handle_crash(&self, job_id: Uuid, message: &str) -> Result<CrashOutcome> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        if job.is_terminal() {
            return Ok(CrashOutcome::Finished(job.status));
        }
        if job.status != JobStatus::Running {
            return Ok(CrashOutcome::Requeued);
        }

        let error = StageError::worker_crash(message);
        if job.attempt_count < self.retry.max_attempts {
            warn!(
                subsystem = "worker",
                job_id = %job_id,
                attempt = job.attempt_count,
                error = %error,
                "Worker crashed mid-job, requeueing"
            );
            self.apply(
                job_id,
                JobUpdate::Retry {
                    stage_index: job.stage_index,
                    error,
                },
            )
            .await?;
            Ok(CrashOutcome::Requeued)
        } else {
            error!(
                subsystem = "worker",
                job_id = %job_id,
                attempt = job.attempt_count,
                error = %error,
                "Worker crashed on final attempt, failing job"
            );
            self.apply(
                job_id,
                JobUpdate::Fail {
                    stage_index: job.stage_index,
                    error,
                },
            )
            .await?;
            Ok(CrashOutcome::Failed)
        }
    }

    /// [`JobRunner::run`] with panics contained to the job.
    ///
    /// A panicking attempt is treated as a worker crash and the job is run
    /// again while crash recovery requeues it.
    pub async fn run_isolated(&self, job_id: Uuid) -> Result<JobStatus> {
        loop {
            match AssertUnwindSafe(self.run(job_id)).catch_unwind().await {
                Ok(result) => return result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    match self.handle_crash(job_id, &message).await? {
                        CrashOutcome::Requeued => continue,
                        CrashOutcome::Failed => return Ok(JobStatus::Failed),
                        CrashOutcome::Finished(status) => return Ok(status),
                    }
                }
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
