//! Pipeline engine: accepts submissions, deduplicates them and hands the
//! remaining jobs to the configured scheduler.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use docflow_core::{
    defaults, new_v7, Batch, Classifier, ContentHasher, CorrelationProgress, DocumentStore,
    Embedder, Error, EventBus, EventEnvelope, Extractor, Job, JobRepository, JobSpec, JobStatus,
    JobUpdate, ProgressSnapshot, Result, Strategy, TaskQueue,
};

use crate::config::EngineConfig;
use crate::extraction::ExtractorRegistry;
use crate::memory::{MemoryDocumentStore, MemoryJobRepository};
use crate::pipeline::{Collaborators, StagePipeline};
use crate::progress::{snapshot_from_repository, ProgressPublisher};
use crate::rate_limit::ServiceLimiter;
use crate::registry::BatchRegistry;
use crate::runner::JobRunner;
use crate::scheduler::{AsyncScheduler, DistributedScheduler, PoolScheduler, Scheduler};

/// Returned by batch submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub batch_id: Uuid,
    pub correlation_id: Option<String>,
    /// Every job of the batch, in submission order.
    pub job_ids: Vec<Uuid>,
    /// Jobs marked Skipped as duplicates at submission.
    pub skipped: usize,
    /// Jobs handed to the scheduler.
    pub dispatched: usize,
}

/// Returned by single-file submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub skipped: bool,
}

/// Assembles a [`PipelineEngine`].
///
/// Only the classifier is required. Without a repository or store the
/// engine keeps everything in memory; the distributed strategy also needs
/// a task queue.
pub struct EngineBuilder {
    config: EngineConfig,
    jobs: Option<Arc<dyn JobRepository>>,
    extractor: Option<Arc<dyn Extractor>>,
    classifier: Option<Arc<dyn Classifier>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn DocumentStore>>,
    queue: Option<Arc<dyn TaskQueue>>,
    events: Option<Arc<EventBus>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            jobs: None,
            extractor: None,
            classifier: None,
            embedder: None,
            store: None,
            queue: None,
            events: None,
        }
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobRepository>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn runner(&self) -> Result<(JobRunner, Arc<dyn JobRepository>)> {
        self.config.validate()?;
        let classifier = self
            .classifier
            .clone()
            .ok_or_else(|| Error::Config("a classifier is required".into()))?;
        let jobs: Arc<dyn JobRepository> = self
            .jobs
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryJobRepository::new()));

        let collaborators = Collaborators {
            extractor: self
                .extractor
                .clone()
                .unwrap_or_else(|| Arc::new(ExtractorRegistry::with_defaults())),
            classifier,
            embedder: self.embedder.clone(),
            store: self
                .store
                .clone()
                .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new())),
        };
        // One limiter for every Classify and Embed stage in this process.
        let limiter = ServiceLimiter::new(self.config.ai_min_interval);
        let pipeline = StagePipeline::standard(collaborators, limiter, self.config.stage_timeout);

        let registry = BatchRegistry::new(
            self.config.throughput_window,
            defaults::THROUGHPUT_MAX_SAMPLES,
        );
        let events = self
            .events
            .clone()
            .unwrap_or_else(|| Arc::new(EventBus::default()));
        let publisher = ProgressPublisher::new(Arc::new(registry), events);

        let runner = JobRunner::new(
            Arc::new(pipeline),
            Arc::clone(&jobs),
            self.config.retry,
            publisher,
        );
        Ok((runner, jobs))
    }

    /// Build only the job runner, for processes that execute queued jobs
    /// without submitting any.
    pub fn into_runner(self) -> Result<JobRunner> {
        self.runner().map(|(runner, _)| runner)
    }

    /// Build the engine and start its scheduler.
    ///
    /// Scheduler startup failures (no queue, unreachable queue, no worker
    /// threads) are returned here, before any job is accepted.
    pub async fn build(self) -> Result<PipelineEngine> {
        let (runner, jobs) = self.runner()?;
        let config = self.config;

        let scheduler: Arc<dyn Scheduler> = match config.strategy {
            Strategy::Pool => Arc::new(PoolScheduler::start(
                runner.clone(),
                config.resolved_workers(),
                config.chunk_size,
                config.poll_interval,
            )?),
            Strategy::Async => Arc::new(AsyncScheduler::start(
                runner.clone(),
                config.max_concurrent,
                config.poll_interval,
            )?),
            Strategy::Distributed => {
                let queue = self.queue.ok_or_else(|| {
                    Error::Config("the distributed strategy needs a task queue".into())
                })?;
                Arc::new(
                    DistributedScheduler::connect(
                        queue,
                        Arc::clone(&jobs),
                        config.max_in_flight,
                        config.poll_interval,
                        config.throughput_window,
                    )
                    .await?,
                )
            }
        };

        info!(
            subsystem = "engine",
            strategy = config.strategy.as_str(),
            stages = ?runner.pipeline().stage_names(),
            "Pipeline engine ready"
        );

        Ok(PipelineEngine {
            hasher: ContentHasher::new(config.strong_hash_max_bytes),
            config,
            jobs,
            runner,
            scheduler,
        })
    }
}

/// Entry point for submitting documents and following their progress.
///
/// Submissions return once jobs are deduplicated and handed to the
/// scheduler; they never wait for processing.
///
/// `cancel` stops dispatching the batch's remaining jobs. Jobs already
/// running are not interrupted: in-process schedulers let them finish and
/// the distributed scheduler leaves jobs a worker has claimed to that worker.
///
/// Finished and cancelled batches are dropped from the in-process registry
/// once `batch_retention` has passed; their progress is then read from the
/// job repository.
#[derive(Clone)]
pub struct PipelineEngine {
    config: EngineConfig,
    hasher: ContentHasher,
    jobs: Arc<dyn JobRepository>,
    runner: JobRunner,
    scheduler: Arc<dyn Scheduler>,
}

impl PipelineEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.scheduler.strategy()
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.jobs
    }

    /// Submit a batch of jobs.
    ///
    /// Within the batch only the first job of each fingerprint runs; later
    /// ones are Skipped with a reference to it. A job whose fingerprint
    /// already succeeded before is Skipped unless it is forced.
    pub async fn submit_batch(
        &self,
        specs: Vec<JobSpec>,
        correlation_id: Option<String>,
    ) -> Result<BatchHandle> {
        if specs.is_empty() {
            return Err(Error::InvalidInput("batch has no jobs".into()));
        }
        self.evict_expired();

        let batch_id = new_v7();
        let mut jobs = Vec::with_capacity(specs.len());
        for mut spec in specs {
            if !self.config.embed {
                spec.params.embed = false;
            }
            let fingerprint = self.hasher.fingerprint(&spec.source).await?;
            jobs.push(Job::new(batch_id, spec, fingerprint));
        }

        let mut survivors: HashMap<&str, Uuid> = HashMap::new();
        let mut skips: Vec<(Uuid, Uuid)> = Vec::new();
        for job in &jobs {
            if let Some(&survivor) = survivors.get(job.content_hash.as_str()) {
                skips.push((job.id, survivor));
                continue;
            }
            let prior = if job.force {
                None
            } else {
                self.jobs.find_succeeded_by_hash(&job.content_hash).await?
            };
            match prior {
                Some(prior) => {
                    skips.push((job.id, prior));
                    survivors.insert(&job.content_hash, prior);
                }
                None => {
                    survivors.insert(&job.content_hash, job.id);
                }
            }
        }

        let batch = Batch::new(batch_id, correlation_id.clone(), &jobs);
        self.jobs.create_batch(&batch, &jobs).await?;
        self.runner.publisher().register(&batch, &jobs);

        let mut skipped_ids = HashSet::with_capacity(skips.len());
        for (job_id, duplicate_of) in skips {
            debug!(
                subsystem = "engine",
                job_id = %job_id,
                duplicate_of = %duplicate_of,
                "Duplicate fingerprint, job skipped"
            );
            let applied = self
                .jobs
                .update(
                    job_id,
                    JobUpdate::Skip {
                        duplicate_of: Some(duplicate_of),
                    },
                )
                .await?;
            self.runner.publisher().record(&applied);
            skipped_ids.insert(job_id);
        }

        let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        let runnable: Vec<Job> = jobs
            .into_iter()
            .filter(|j| !skipped_ids.contains(&j.id))
            .collect();
        let dispatched = if runnable.is_empty() {
            0
        } else {
            self.scheduler.submit(batch_id, &runnable).await?
        };

        info!(
            subsystem = "engine",
            batch_id = %batch_id,
            correlation_id = correlation_id.as_deref().unwrap_or(""),
            strategy = self.strategy().as_str(),
            job_count = job_ids.len(),
            skipped = skipped_ids.len(),
            dispatched,
            "Batch submitted"
        );

        Ok(BatchHandle {
            batch_id,
            correlation_id,
            job_ids,
            skipped: skipped_ids.len(),
            dispatched,
        })
    }

    /// Submit one file as its own batch.
    pub async fn submit_file(&self, path: impl Into<PathBuf>) -> Result<JobHandle> {
        let handle = self
            .submit_batch(vec![JobSpec::file(path)], None)
            .await?;
        let job_id = handle
            .job_ids
            .first()
            .copied()
            .ok_or_else(|| Error::Internal("batch created without its job".into()))?;
        Ok(JobHandle {
            job_id,
            batch_id: handle.batch_id,
            skipped: handle.skipped > 0,
        })
    }

    /// Submit every file under `path` as one batch.
    pub async fn submit_directory(
        &self,
        path: impl AsRef<Path>,
        recursive: bool,
        correlation_id: Option<String>,
    ) -> Result<BatchHandle> {
        let path = path.as_ref();
        let files = collect_files(path, recursive)?;
        if files.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no files found in {}",
                path.display()
            )));
        }
        self.submit_batch(files.into_iter().map(JobSpec::file).collect(), correlation_id)
            .await
    }

    /// Falls back to the job repository for batches no longer tracked here.
    pub async fn progress(&self, batch_id: Uuid) -> Result<ProgressSnapshot> {
        match self.scheduler.progress(batch_id).await {
            Ok(snapshot) => {
                if snapshot.is_complete() {
                    self.runner.publisher().registry().mark_settled(batch_id);
                }
                Ok(snapshot)
            }
            Err(Error::BatchNotFound(_)) => {
                snapshot_from_repository(
                    self.jobs.as_ref(),
                    batch_id,
                    self.config.throughput_window,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// Progress summed over the batches submitted with `correlation_id`
    /// that this process still tracks.
    pub async fn progress_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<CorrelationProgress>> {
        let batch_ids = self
            .runner
            .publisher()
            .registry()
            .batches_for_correlation(correlation_id);
        let mut snapshots = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            snapshots.push(self.progress(batch_id).await?);
        }
        Ok(CorrelationProgress::aggregate(correlation_id, &snapshots))
    }

    /// Stop dispatching the batch. See the type docs for what happens to
    /// running jobs.
    pub async fn cancel(&self, batch_id: Uuid) -> Result<()> {
        self.scheduler.cancel(batch_id).await?;
        self.runner.publisher().registry().mark_settled(batch_id);
        self.evict_expired();
        Ok(())
    }

    /// Drop batches settled longer than `batch_retention` ago from the
    /// registry and the scheduler. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let registry = self.runner.publisher().registry();
        let mut evicted = 0;
        for batch_id in registry.expired(self.config.batch_retention, Instant::now()) {
            if self.scheduler.forget(batch_id) && registry.remove(batch_id) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(
                subsystem = "engine",
                evicted,
                remaining = registry.len(),
                "Evicted settled batches"
            );
        }
        evicted
    }

    /// Batches tracked in this process.
    pub fn tracked_batches(&self) -> usize {
        self.runner.publisher().registry().len()
    }

    /// Wait until the batch completes or, if cancelled, nothing of it is
    /// still running.
    pub async fn wait_for_batch(&self, batch_id: Uuid) -> Result<ProgressSnapshot> {
        let registry = self.runner.publisher().registry();
        if self.strategy() != Strategy::Distributed && !registry.contains(batch_id) {
            return self.progress(batch_id).await;
        }
        let snapshot = self.scheduler.wait_for_batch(batch_id).await?;
        if snapshot.is_complete() {
            registry.mark_settled(batch_id);
        }
        Ok(snapshot)
    }

    /// Every pipeline event seen by this process.
    ///
    /// With the distributed strategy, transitions happen in worker processes
    /// and only show up here if those workers share this engine's runner.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.runner.publisher().subscribe()
    }

    pub fn subscribe_batch(
        &self,
        batch_id: Uuid,
    ) -> impl Stream<Item = EventEnvelope> + Send + Unpin + 'static {
        self.runner.publisher().subscribe_batch(batch_id)
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.jobs.get(job_id).await
    }

    pub async fn jobs_for_batch(&self, batch_id: Uuid) -> Result<Vec<Job>> {
        self.jobs.list_for_batch(batch_id).await
    }

    /// Per-job statuses as tracked in this process.
    pub fn job_statuses(&self, batch_id: Uuid) -> Option<Vec<(Uuid, JobStatus)>> {
        self.runner.publisher().registry().job_statuses(batch_id)
    }

    /// Stop the scheduler. Running jobs finish first.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await
    }
}

/// Files under `root` in name order. Hidden entries are ignored. A file
/// path yields itself.
pub fn collect_files(root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        return Err(Error::InvalidInput(format!(
            "not a file or directory: {}",
            root.display()
        )));
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
