//! Core data models for docflow.
//!
//! These types are shared across all docflow crates: the job and batch
//! records, the job state machine, submission specs, progress snapshots and
//! the typed outputs passed between pipeline stages.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::hashing::Fingerprint;
use crate::stage::StageError;

// =============================================================================
// JOB STATUS
// =============================================================================

/// Status of a job.
///
/// `Succeeded`, `Failed` and `Skipped` are terminal; a job never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(Error::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

// =============================================================================
// SUBMISSION TYPES
// =============================================================================

/// Where a job's source document lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum SourceRef {
    /// Local filesystem path.
    Path(PathBuf),
    /// Opaque blob reference (object storage key, URL).
    Blob { uri: String },
}

impl SourceRef {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        SourceRef::Path(path.into())
    }

    pub fn blob(uri: impl Into<String>) -> Self {
        SourceRef::Blob { uri: uri.into() }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            SourceRef::Path(p) => Some(p.as_path()),
            SourceRef::Blob { .. } => None,
        }
    }

    /// Lowercased file extension, if any.
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            SourceRef::Path(p) => p.file_name()?.to_str()?,
            SourceRef::Blob { uri } => uri.rsplit('/').next()?,
        };
        let (_, ext) = name.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext.to_ascii_lowercase())
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Path(p) => write!(f, "{}", p.display()),
            SourceRef::Blob { uri } => f.write_str(uri),
        }
    }
}

/// Per-job stage parameters. Travels with the job onto the distributed queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageParams {
    /// Run the optional Embed stage.
    #[serde(default = "default_embed")]
    pub embed: bool,
    /// Overrides the pipeline's per-stage timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_ms: Option<u64>,
}

fn default_embed() -> bool {
    true
}

impl Default for StageParams {
    fn default() -> Self {
        Self {
            embed: true,
            stage_timeout_ms: None,
        }
    }
}

/// One document to process, as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub source: SourceRef,
    /// Bypass dedup against prior succeeded fingerprints.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub params: StageParams,
}

impl JobSpec {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(SourceRef::path(path))
    }

    pub fn new(source: SourceRef) -> Self {
        Self {
            source,
            force: false,
            params: StageParams::default(),
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }
}

/// Scheduling strategy selecting the Scheduler implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Thread pool; CPU-heavy stages.
    #[default]
    Pool,
    /// Single-threaded cooperative; I/O-heavy stages.
    Async,
    /// Durable queue plus remote workers.
    Distributed,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Pool => "pool",
            Strategy::Async => "async",
            Strategy::Distributed => "distributed",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pool" => Ok(Strategy::Pool),
            "async" | "cooperative" => Ok(Strategy::Async),
            "distributed" => Ok(Strategy::Distributed),
            other => Err(Error::Config(format!(
                "unknown strategy '{other}' (expected pool, async or distributed)"
            ))),
        }
    }
}

// =============================================================================
// STAGE OUTPUTS
// =============================================================================

/// Output of the Extract stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub text: String,
    pub content_type: String,
    /// Size of the source in bytes.
    pub source_bytes: u64,
}

/// Output of the Classify stage.
///
/// `confidence` is whatever the classifier reported. It is carried as
/// metadata and never interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Output of the Embed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub vector: Vec<f32>,
    /// True when the embedder failed and a zero vector was substituted.
    pub fallback: bool,
}

impl EmbeddingOutput {
    pub fn zero(dimension: usize) -> Self {
        Self {
            vector: vec![0.0; dimension],
            fallback: true,
        }
    }
}

/// What the Store stage persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub source_ref: SourceRef,
    pub content_hash: String,
    pub text: String,
    pub content_type: String,
    pub classification: Classification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub embedding_fallback: bool,
}

/// Summary of a successful pipeline run, persisted on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResult {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub content_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    #[serde(default)]
    pub embedding_fallback: bool,
}

impl DocumentResult {
    pub fn from_record(record: &DocumentRecord) -> Self {
        Self {
            category: record.classification.category.clone(),
            confidence: record.classification.confidence,
            content_length: record.text.chars().count(),
            embedding_dim: record.embedding.as_ref().map(Vec::len),
            embedding_fallback: record.embedding_fallback,
        }
    }
}

// =============================================================================
// JOB
// =============================================================================

/// One document moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub source_ref: SourceRef,
    pub content_hash: String,
    /// `content_hash` was derived from path metadata, not content.
    pub weak_hash: bool,
    pub force: bool,
    pub params: StageParams,
    /// Index of the last stage reached (the failing stage for failed jobs).
    pub stage_index: i32,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub last_error: Option<StageError>,
    /// Surviving job this one duplicates (Skipped jobs only).
    pub duplicate_of: Option<Uuid>,
    pub result: Option<DocumentResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A mutation of a job, validated by [`Job::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// Owner begins an attempt.
    Start,
    /// Attempt failed with a retryable error; another attempt will follow.
    Retry { stage_index: i32, error: StageError },
    /// Pipeline completed, Store included.
    Succeed {
        stage_index: i32,
        result: DocumentResult,
    },
    /// Job gave up.
    Fail { stage_index: i32, error: StageError },
    /// Job is a duplicate and will not be dispatched.
    Skip { duplicate_of: Option<Uuid> },
}

impl JobUpdate {
    /// Status this update moves the job to.
    pub fn target(&self) -> JobStatus {
        match self {
            JobUpdate::Start => JobStatus::Running,
            JobUpdate::Retry { .. } => JobStatus::Retrying,
            JobUpdate::Succeed { .. } => JobStatus::Succeeded,
            JobUpdate::Fail { .. } => JobStatus::Failed,
            JobUpdate::Skip { .. } => JobStatus::Skipped,
        }
    }
}

/// Outcome of applying a [`JobUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub previous: JobStatus,
    pub job: Job,
}

impl Job {
    pub fn new(batch_id: Uuid, spec: JobSpec, fingerprint: Fingerprint) -> Self {
        let now = Utc::now();
        Self {
            id: crate::uuid_utils::new_v7(),
            batch_id,
            source_ref: spec.source,
            content_hash: fingerprint.hash,
            weak_hash: fingerprint.weak,
            force: spec.force,
            params: spec.params,
            stage_index: 0,
            status: JobStatus::Pending,
            attempt_count: 0,
            last_error: None,
            duplicate_of: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply `update` to this job, enforcing the job state machine.
    ///
    /// Returns the status the job had before the update. Terminal jobs reject
    /// every update.
    pub fn apply(&mut self, update: JobUpdate) -> Result<JobStatus> {
        let previous = self.status;
        let allowed = match &update {
            JobUpdate::Start => matches!(previous, JobStatus::Pending | JobStatus::Retrying),
            JobUpdate::Retry { .. } | JobUpdate::Succeed { .. } => previous == JobStatus::Running,
            JobUpdate::Fail { .. } => matches!(
                previous,
                JobStatus::Pending | JobStatus::Running | JobStatus::Retrying
            ),
            JobUpdate::Skip { .. } => previous == JobStatus::Pending,
        };
        if !allowed {
            return Err(Error::InvalidTransition {
                job_id: self.id,
                from: previous,
                to: update.target().as_str(),
            });
        }

        self.status = update.target();
        match update {
            JobUpdate::Start => {
                self.attempt_count += 1;
            }
            JobUpdate::Retry { stage_index, error } | JobUpdate::Fail { stage_index, error } => {
                self.stage_index = stage_index;
                self.last_error = Some(error);
            }
            JobUpdate::Succeed {
                stage_index,
                result,
            } => {
                self.stage_index = stage_index;
                self.result = Some(result);
            }
            JobUpdate::Skip { duplicate_of } => {
                self.duplicate_of = duplicate_of;
            }
        }
        self.updated_at = Utc::now();
        Ok(previous)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// =============================================================================
// BATCH
// =============================================================================

/// Batch lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Open,
    Completed,
}

/// Aggregate job counters for a batch.
///
/// `pending` counts every non-terminal job (running and retrying included),
/// so `total == succeeded + failed + skipped + pending` always holds.
/// `running` is the subset of `pending` currently executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pending: u64,
    pub running: u64,
}

impl BatchCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.total += 1;
            counts.add(status);
        }
        counts
    }

    /// Move one job from `old` to `new`.
    pub fn transition(&mut self, old: JobStatus, new: JobStatus) {
        self.remove(old);
        self.add(new);
    }

    pub fn terminal(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Running => {
                self.pending += 1;
                self.running += 1;
            }
            JobStatus::Pending | JobStatus::Retrying => self.pending += 1,
        }
    }

    fn remove(&mut self, status: JobStatus) {
        match status {
            JobStatus::Succeeded => self.succeeded = self.succeeded.saturating_sub(1),
            JobStatus::Failed => self.failed = self.failed.saturating_sub(1),
            JobStatus::Skipped => self.skipped = self.skipped.saturating_sub(1),
            JobStatus::Running => {
                self.pending = self.pending.saturating_sub(1);
                self.running = self.running.saturating_sub(1);
            }
            JobStatus::Pending | JobStatus::Retrying => {
                self.pending = self.pending.saturating_sub(1)
            }
        }
    }
}

/// A caller-defined group of jobs submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    /// External grouping key; never used for scheduling.
    pub correlation_id: Option<String>,
    pub job_ids: Vec<Uuid>,
    pub counts: BatchCounts,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(batch_id: Uuid, correlation_id: Option<String>, jobs: &[Job]) -> Self {
        let counts = BatchCounts::from_statuses(jobs.iter().map(|j| j.status));
        let now = Utc::now();
        let complete = counts.is_complete();
        Self {
            batch_id,
            correlation_id,
            job_ids: jobs.iter().map(|j| j.id).collect(),
            counts,
            status: if complete {
                BatchStatus::Completed
            } else {
                BatchStatus::Open
            },
            created_at: now,
            completed_at: complete.then_some(now),
        }
    }
}

// =============================================================================
// PROGRESS
// =============================================================================

/// Point-in-time read of a batch's counters plus derived throughput and ETA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub batch_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pending: u64,
    pub running: u64,
    pub status: BatchStatus,
    /// Terminal jobs per second over the recent window.
    pub throughput_per_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn from_counts(batch_id: Uuid, correlation_id: Option<String>, counts: BatchCounts) -> Self {
        Self {
            batch_id,
            correlation_id,
            total: counts.total,
            succeeded: counts.succeeded,
            failed: counts.failed,
            skipped: counts.skipped,
            pending: counts.pending,
            running: counts.running,
            status: if counts.is_complete() {
                BatchStatus::Completed
            } else {
                BatchStatus::Open
            },
            throughput_per_sec: 0.0,
            eta: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Completed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Counters summed over every batch submitted under one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationProgress {
    pub correlation_id: String,
    /// Batches included, oldest first.
    pub batch_ids: Vec<Uuid>,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pending: u64,
    pub running: u64,
    /// Sum of the batches' rates.
    pub throughput_per_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Duration>,
}

impl CorrelationProgress {
    /// Sum `snapshots`. Returns `None` when there are none.
    pub fn aggregate(correlation_id: &str, snapshots: &[ProgressSnapshot]) -> Option<Self> {
        if snapshots.is_empty() {
            return None;
        }
        let mut batch_ids: Vec<Uuid> = snapshots.iter().map(|s| s.batch_id).collect();
        batch_ids.sort();

        let mut progress = Self {
            correlation_id: correlation_id.to_string(),
            batch_ids,
            total: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            pending: 0,
            running: 0,
            throughput_per_sec: 0.0,
            eta: None,
        };
        for s in snapshots {
            progress.total += s.total;
            progress.succeeded += s.succeeded;
            progress.failed += s.failed;
            progress.skipped += s.skipped;
            progress.pending += s.pending;
            progress.running += s.running;
            progress.throughput_per_sec += s.throughput_per_sec;
        }
        progress.eta = if progress.pending == 0 {
            Some(Duration::ZERO)
        } else if progress.throughput_per_sec > 0.0 {
            Duration::try_from_secs_f64(progress.pending as f64 / progress.throughput_per_sec).ok()
        } else {
            None
        };
        Some(progress)
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

// =============================================================================
// QUEUE PAYLOAD
// =============================================================================

/// Versioned message placed on the durable queue for remote workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub version: u32,
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub source_ref: SourceRef,
    pub content_hash: String,
    pub params: StageParams,
}

impl TaskPayload {
    pub fn for_job(job: &Job) -> Self {
        Self {
            version: defaults::TASK_PAYLOAD_VERSION,
            job_id: job.id,
            batch_id: job.batch_id,
            source_ref: job.source_ref.clone(),
            content_hash: job.content_hash.clone(),
            params: job.params.clone(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.version == defaults::TASK_PAYLOAD_VERSION
    }
}
