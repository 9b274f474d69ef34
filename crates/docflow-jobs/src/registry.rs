//! Per-batch counters, per-job status and throughput estimation.
//!
//! Every scheduler records job transitions here. Each batch has its own
//! mutex, so batches never contend with each other.
//!
//! A batch is settled once it completes, is cancelled, or is seen complete
//! through the job repository. Settled batches become eligible for eviction
//! after the retention window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use docflow_core::{
    defaults, Batch, BatchCounts, BatchStatus, CorrelationProgress, Error, Job, JobStatus,
    ProgressSnapshot, Result,
};

/// Terminal jobs per second over `span`, never dividing by less than 1ms.
pub fn rate_over(completions: usize, span: Duration) -> f64 {
    if completions == 0 {
        return 0.0;
    }
    completions as f64 / span.max(Duration::from_millis(1)).as_secs_f64()
}

/// Time to drain `pending` jobs at `rate` per second.
pub fn eta_for(pending: u64, rate: f64) -> Option<Duration> {
    if pending == 0 {
        return Some(Duration::ZERO);
    }
    if rate <= 0.0 || !rate.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(pending as f64 / rate).ok()
}

/// Rolling window of recent completion times.
///
/// The rate counts completions inside the window divided by the part of the
/// window the batch has existed for, so early estimates are not inflated by
/// a short span.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    started: Instant,
    window: Duration,
    max_samples: usize,
    samples: VecDeque<Instant>,
}

impl ThroughputWindow {
    pub fn new(started: Instant, window: Duration, max_samples: usize) -> Self {
        Self {
            started,
            window,
            max_samples: max_samples.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(at);
    }

    pub fn rate(&self, now: Instant) -> f64 {
        let horizon = now.checked_sub(self.window).unwrap_or(self.started);
        let from = horizon.max(self.started);
        let count = self.samples.iter().filter(|s| **s >= from).count();
        rate_over(count, now.saturating_duration_since(from))
    }

    pub fn eta(&self, pending: u64, now: Instant) -> Option<Duration> {
        eta_for(pending, self.rate(now))
    }
}

struct BatchState {
    counts: BatchCounts,
    /// Submission order.
    order: Vec<Uuid>,
    statuses: HashMap<Uuid, JobStatus>,
    throughput: ThroughputWindow,
    status: BatchStatus,
    completed_at: Option<DateTime<Utc>>,
    settled_at: Option<Instant>,
}

impl BatchState {
    fn has_active_jobs(&self) -> bool {
        self.statuses
            .values()
            .any(|s| matches!(s, JobStatus::Running | JobStatus::Retrying))
    }
}

struct BatchEntry {
    correlation_id: Option<String>,
    state: Mutex<BatchState>,
    done_tx: watch::Sender<bool>,
}

/// Result of [`BatchRegistry::record_transition`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTransition {
    pub batch_id: Uuid,
    pub correlation_id: Option<String>,
    /// Status the registry had for the job before this transition.
    pub from: JobStatus,
    /// This transition terminated the batch's last job.
    pub batch_completed: bool,
}

/// Batch and job status registry shared by every scheduler in the process.
pub struct BatchRegistry {
    batches: DashMap<Uuid, Arc<BatchEntry>>,
    job_index: DashMap<Uuid, Uuid>,
    window: Duration,
    max_samples: usize,
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(defaults::THROUGHPUT_WINDOW_SECS),
            defaults::THROUGHPUT_MAX_SAMPLES,
        )
    }
}

impl BatchRegistry {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            batches: DashMap::new(),
            job_index: DashMap::new(),
            window,
            max_samples,
        }
    }

    /// Start tracking a batch with its jobs' current statuses.
    pub fn register(&self, batch: &Batch, jobs: &[Job]) {
        let statuses: HashMap<Uuid, JobStatus> = jobs.iter().map(|j| (j.id, j.status)).collect();
        let counts = BatchCounts::from_statuses(jobs.iter().map(|j| j.status));
        let complete = counts.is_complete();
        let (done_tx, _) = watch::channel(complete);

        let entry = BatchEntry {
            correlation_id: batch.correlation_id.clone(),
            state: Mutex::new(BatchState {
                counts,
                order: jobs.iter().map(|j| j.id).collect(),
                statuses,
                throughput: ThroughputWindow::new(Instant::now(), self.window, self.max_samples),
                status: if complete {
                    BatchStatus::Completed
                } else {
                    BatchStatus::Open
                },
                completed_at: complete.then(Utc::now),
                settled_at: complete.then(Instant::now),
            }),
            done_tx,
        };

        for job in jobs {
            self.job_index.insert(job.id, batch.batch_id);
        }
        self.batches.insert(batch.batch_id, Arc::new(entry));
        debug!(
            subsystem = "engine",
            component = "registry",
            batch_id = %batch.batch_id,
            job_count = jobs.len(),
            "Batch registered"
        );
    }

    /// Record that `job_id` moved from `old` to `new`.
    ///
    /// The registry's own view of the job wins over `old` when they disagree.
    /// A job the registry already holds as terminal is never moved again.
    pub fn record_transition(
        &self,
        job_id: Uuid,
        old: JobStatus,
        new: JobStatus,
    ) -> Result<RecordedTransition> {
        let batch_id = *self
            .job_index
            .get(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        let entry = self
            .batches
            .get(&batch_id)
            .map(|e| Arc::clone(&e))
            .ok_or(Error::BatchNotFound(batch_id))?;

        let mut state = entry.state.lock();
        let current = state.statuses.get(&job_id).copied().unwrap_or(old);
        if current.is_terminal() {
            return Err(Error::InvalidTransition {
                job_id,
                from: current,
                to: new.as_str(),
            });
        }
        if current != old {
            debug!(
                subsystem = "engine",
                component = "registry",
                job_id = %job_id,
                expected = %old,
                actual = %current,
                "Transition source differs from registry"
            );
        }

        state.counts.transition(current, new);
        state.statuses.insert(job_id, new);
        if matches!(new, JobStatus::Succeeded | JobStatus::Failed) {
            state.throughput.record(Instant::now());
        }

        let mut batch_completed = false;
        if state.counts.is_complete() && state.status == BatchStatus::Open {
            state.status = BatchStatus::Completed;
            state.completed_at = Some(Utc::now());
            state.settled_at.get_or_insert_with(Instant::now);
            batch_completed = true;
        }
        drop(state);

        if batch_completed {
            entry.done_tx.send_replace(true);
        }

        Ok(RecordedTransition {
            batch_id,
            correlation_id: entry.correlation_id.clone(),
            from: current,
            batch_completed,
        })
    }

    pub fn snapshot(&self, batch_id: Uuid) -> Option<ProgressSnapshot> {
        let entry = self.batches.get(&batch_id).map(|e| Arc::clone(&e))?;
        Some(entry_snapshot(batch_id, &entry, Instant::now()))
    }

    /// Batches tracked under `correlation_id`.
    pub fn batches_for_correlation(&self, correlation_id: &str) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .batches
            .iter()
            .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// Counters summed over every tracked batch of `correlation_id`.
    pub fn progress_by_correlation(&self, correlation_id: &str) -> Option<CorrelationProgress> {
        let now = Instant::now();
        let snapshots: Vec<ProgressSnapshot> = self
            .batches
            .iter()
            .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
            .map(|e| entry_snapshot(*e.key(), e.value(), now))
            .collect();
        CorrelationProgress::aggregate(correlation_id, &snapshots)
    }

    /// Start the retention clock for a batch that will see no further
    /// local transitions it needs tracking for. No-op once settled.
    pub fn mark_settled(&self, batch_id: Uuid) {
        if let Some(entry) = self.batches.get(&batch_id).map(|e| Arc::clone(&e)) {
            entry.state.lock().settled_at.get_or_insert_with(Instant::now);
        }
    }

    /// Settled batches older than `retention` with no job running or
    /// waiting for a retry.
    pub fn expired(&self, retention: Duration, now: Instant) -> Vec<Uuid> {
        self.batches
            .iter()
            .filter(|e| {
                let state = e.state.lock();
                state
                    .settled_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= retention)
                    && !state.has_active_jobs()
            })
            .map(|e| *e.key())
            .collect()
    }

    /// Per-job status in submission order.
    pub fn job_statuses(&self, batch_id: Uuid) -> Option<Vec<(Uuid, JobStatus)>> {
        let entry = self.batches.get(&batch_id).map(|e| Arc::clone(&e))?;
        let state = entry.state.lock();
        Some(
            state
                .order
                .iter()
                .filter_map(|id| state.statuses.get(id).map(|s| (*id, *s)))
                .collect(),
        )
    }

    /// Any job of the batch running or waiting for a retry.
    pub fn has_active_jobs(&self, batch_id: Uuid) -> bool {
        let Some(entry) = self.batches.get(&batch_id).map(|e| Arc::clone(&e)) else {
            return false;
        };
        let has_active = entry.state.lock().has_active_jobs();
        has_active
    }

    pub fn completed_at(&self, batch_id: Uuid) -> Option<DateTime<Utc>> {
        let entry = self.batches.get(&batch_id).map(|e| Arc::clone(&e))?;
        let completed_at = entry.state.lock().completed_at;
        completed_at
    }

    /// Receiver that flips to `true` when the batch completes.
    pub fn completion(&self, batch_id: Uuid) -> Option<watch::Receiver<bool>> {
        self.batches
            .get(&batch_id)
            .map(|entry| entry.done_tx.subscribe())
    }

    pub fn batch_for_job(&self, job_id: Uuid) -> Option<Uuid> {
        self.job_index.get(&job_id).map(|id| *id)
    }

    pub fn contains(&self, batch_id: Uuid) -> bool {
        self.batches.contains_key(&batch_id)
    }

    /// Stop tracking a batch.
    pub fn remove(&self, batch_id: Uuid) -> bool {
        let Some((_, entry)) = self.batches.remove(&batch_id) else {
            return false;
        };
        let order = entry.state.lock().order.clone();
        for job_id in order {
            self.job_index.remove(&job_id);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

fn entry_snapshot(batch_id: Uuid, entry: &BatchEntry, now: Instant) -> ProgressSnapshot {
    let state = entry.state.lock();
    let mut snapshot =
        ProgressSnapshot::from_counts(batch_id, entry.correlation_id.clone(), state.counts);
    snapshot.status = state.status;
    snapshot.throughput_per_sec = state.throughput.rate(now);
    snapshot.eta = state.throughput.eta(state.counts.pending, now);
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{Fingerprint, JobSpec};

    fn batch(n: usize) -> (Batch, Vec<Job>) {
        let batch_id = Uuid::new_v4();
        let jobs: Vec<Job> = (0..n)
            .map(|i| {
                Job::new(
                    batch_id,
                    JobSpec::file(format!("/tmp/{i}.txt")),
                    Fingerprint::strong(format!("sha256:{i}")),
                )
            })
            .collect();
        (Batch::new(batch_id, Some("upload-1".into()), &jobs), jobs)
    }

    fn assert_invariant(s: &ProgressSnapshot) {
        assert_eq!(s.total, s.succeeded + s.failed + s.skipped + s.pending);
    }

    // =========================================================================
    // Counters
    // =========================================================================

    #[test]
    fn test_register_and_snapshot() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(3);
        registry.register(&b, &jobs);

        let s = registry.snapshot(b.batch_id).unwrap();
        assert_eq!(s.total, 3);
        assert_eq!(s.pending, 3);
        assert_eq!(s.correlation_id.as_deref(), Some("upload-1"));
        assert_eq!(s.status, BatchStatus::Open);
        assert_eq!(s.throughput_per_sec, 0.0);
        assert_eq!(s.eta, None);
        assert_invariant(&s);
    }

    #[test]
    fn test_transitions_complete_batch() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(2);
        registry.register(&b, &jobs);
        let mut done = registry.completion(b.batch_id).unwrap();

        registry
            .record_transition(jobs[0].id, JobStatus::Pending, JobStatus::Skipped)
            .unwrap();
        registry
            .record_transition(jobs[1].id, JobStatus::Pending, JobStatus::Running)
            .unwrap();
        let s = registry.snapshot(b.batch_id).unwrap();
        assert_eq!(s.running, 1);
        assert_invariant(&s);

        let t = registry
            .record_transition(jobs[1].id, JobStatus::Running, JobStatus::Failed)
            .unwrap();
        assert!(t.batch_completed);
        assert!(*done.borrow_and_update());

        let s = registry.snapshot(b.batch_id).unwrap();
        assert_eq!(s.failed, 1);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.pending, 0);
        assert!(s.is_complete());
        assert_eq!(s.eta, Some(Duration::ZERO));
        assert!(registry.completed_at(b.batch_id).is_some());
    }

    #[test]
    fn test_terminal_never_regresses() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(1);
        registry.register(&b, &jobs);
        registry
            .record_transition(jobs[0].id, JobStatus::Pending, JobStatus::Skipped)
            .unwrap();

        let err = registry
            .record_transition(jobs[0].id, JobStatus::Skipped, JobStatus::Running)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        let s = registry.snapshot(b.batch_id).unwrap();
        assert_eq!(s.skipped, 1);
        assert_invariant(&s);
    }

    #[test]
    fn test_stale_old_status_uses_registry_view() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(1);
        registry.register(&b, &jobs);
        registry
            .record_transition(jobs[0].id, JobStatus::Pending, JobStatus::Running)
            .unwrap();

        // Caller claims the job was Pending; registry knows it is Running.
        let t = registry
            .record_transition(jobs[0].id, JobStatus::Pending, JobStatus::Retrying)
            .unwrap();
        assert_eq!(t.from, JobStatus::Running);
        let s = registry.snapshot(b.batch_id).unwrap();
        assert_eq!(s.running, 0);
        assert_eq!(s.pending, 1);
    }

    #[test]
    fn test_unknown_job() {
        let registry = BatchRegistry::default();
        let err = registry
            .record_transition(Uuid::new_v4(), JobStatus::Pending, JobStatus::Running)
            .unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[test]
    fn test_job_statuses_and_active() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(3);
        registry.register(&b, &jobs);
        assert!(!registry.has_active_jobs(b.batch_id));

        registry
            .record_transition(jobs[1].id, JobStatus::Pending, JobStatus::Running)
            .unwrap();
        let statuses = registry.job_statuses(b.batch_id).unwrap();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0], (jobs[0].id, JobStatus::Pending));
        assert_eq!(statuses[1], (jobs[1].id, JobStatus::Running));
        assert!(registry.has_active_jobs(b.batch_id));
        assert_eq!(registry.batch_for_job(jobs[2].id), Some(b.batch_id));
    }

    #[test]
    fn test_remove_forgets_jobs() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(2);
        registry.register(&b, &jobs);
        assert!(registry.remove(b.batch_id));
        assert!(!registry.contains(b.batch_id));
        assert_eq!(registry.batch_for_job(jobs[0].id), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_batches_are_independent() {
        let registry = BatchRegistry::default();
        let (a, a_jobs) = batch(1);
        let (b, b_jobs) = batch(1);
        registry.register(&a, &a_jobs);
        registry.register(&b, &b_jobs);

        registry
            .record_transition(a_jobs[0].id, JobStatus::Pending, JobStatus::Skipped)
            .unwrap();
        assert!(registry.snapshot(a.batch_id).unwrap().is_complete());
        assert!(!registry.snapshot(b.batch_id).unwrap().is_complete());
        assert_eq!(registry.len(), 2);
    }

    // =========================================================================
    // Retention
    // =========================================================================

    #[test]
    fn test_completed_batch_expires_after_retention() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(1);
        registry.register(&b, &jobs);
        let retention = Duration::from_secs(60);
        let now = Instant::now();
        assert!(registry.expired(retention, now).is_empty());

        registry
            .record_transition(jobs[0].id, JobStatus::Pending, JobStatus::Skipped)
            .unwrap();
        assert!(registry.expired(retention, now).is_empty());
        assert_eq!(
            registry.expired(retention, now + Duration::from_secs(61)),
            vec![b.batch_id]
        );
        assert!(registry.expired(Duration::ZERO, Instant::now()).contains(&b.batch_id));
    }

    #[test]
    fn test_settled_batch_with_running_job_is_kept() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(2);
        registry.register(&b, &jobs);
        registry
            .record_transition(jobs[0].id, JobStatus::Pending, JobStatus::Running)
            .unwrap();
        registry.mark_settled(b.batch_id);
        assert!(registry.expired(Duration::ZERO, Instant::now()).is_empty());

        registry
            .record_transition(jobs[0].id, JobStatus::Running, JobStatus::Succeeded)
            .unwrap();
        // Job 1 never started; a cancelled batch keeps it Pending.
        assert_eq!(
            registry.expired(Duration::ZERO, Instant::now()),
            vec![b.batch_id]
        );
    }

    #[test]
    fn test_open_batch_never_expires() {
        let registry = BatchRegistry::default();
        let (b, jobs) = batch(1);
        registry.register(&b, &jobs);
        let later = Instant::now() + Duration::from_secs(86_400);
        assert!(registry.expired(Duration::ZERO, later).is_empty());
        assert!(registry.contains(b.batch_id));
    }

    // =========================================================================
    // Correlation
    // =========================================================================

    #[test]
    fn test_progress_by_correlation_spans_batches() {
        let registry = BatchRegistry::default();
        let (a, a_jobs) = batch(2);
        let (b, b_jobs) = batch(3);
        let other_id = Uuid::new_v4();
        let other_jobs = vec![Job::new(
            other_id,
            JobSpec::file("/tmp/other.txt"),
            Fingerprint::strong("sha256:other"),
        )];
        let other = Batch::new(other_id, Some("another".into()), &other_jobs);
        registry.register(&a, &a_jobs);
        registry.register(&b, &b_jobs);
        registry.register(&other, &other_jobs);

        registry
            .record_transition(a_jobs[0].id, JobStatus::Pending, JobStatus::Skipped)
            .unwrap();
        registry
            .record_transition(b_jobs[0].id, JobStatus::Pending, JobStatus::Running)
            .unwrap();

        let progress = registry.progress_by_correlation("upload-1").unwrap();
        let mut expected = vec![a.batch_id, b.batch_id];
        expected.sort();
        assert_eq!(progress.batch_ids, expected);
        assert_eq!(registry.batches_for_correlation("upload-1"), expected);
        assert_eq!(progress.total, 5);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.pending, 4);
        assert_eq!(progress.running, 1);
        assert!(!progress.is_complete());

        assert_eq!(registry.progress_by_correlation("another").unwrap().total, 1);
        assert!(registry.progress_by_correlation("missing").is_none());
    }

    // =========================================================================
    // Throughput
    // =========================================================================

    #[test]
    fn test_rate_over_window() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(start, Duration::from_secs(10), 100);
        for i in 1..=4 {
            window.record(start + Duration::from_secs(i));
        }
        let now = start + Duration::from_secs(4);
        assert!((window.rate(now) - 1.0).abs() < 1e-9);
        assert_eq!(window.eta(8, now), Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_rate_forgets_old_samples() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(start, Duration::from_secs(10), 100);
        for i in 0..10 {
            window.record(start + Duration::from_millis(100 * i));
        }
        // All samples are older than the window; the batch has stalled.
        let now = start + Duration::from_secs(30);
        assert_eq!(window.rate(now), 0.0);
        assert_eq!(window.eta(5, now), None);
    }

    #[test]
    fn test_rate_adapts_to_recent_speed() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(start, Duration::from_secs(10), 100);
        // Slow warm-up: 2 in the first 20s.
        window.record(start + Duration::from_secs(5));
        window.record(start + Duration::from_secs(15));
        // Fast phase: 20 in the last 10s.
        for i in 0..20 {
            window.record(start + Duration::from_secs(20) + Duration::from_millis(500 * i));
        }
        let now = start + Duration::from_secs(30);
        assert!((window.rate(now) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_samples_bounds_memory() {
        let start = Instant::now();
        let mut window = ThroughputWindow::new(start, Duration::from_secs(60), 3);
        for i in 0..10 {
            window.record(start + Duration::from_millis(i));
        }
        assert_eq!(window.samples.len(), 3);
    }

    #[test]
    fn test_eta_helpers() {
        assert_eq!(eta_for(0, 0.0), Some(Duration::ZERO));
        assert_eq!(eta_for(3, 0.0), None);
        assert_eq!(eta_for(3, 1.5), Some(Duration::from_secs(2)));
        assert_eq!(rate_over(0, Duration::ZERO), 0.0);
        assert_eq!(rate_over(1, Duration::ZERO), 1000.0);
    }
}
