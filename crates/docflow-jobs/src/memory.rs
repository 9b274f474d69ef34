//! In-process implementations of the persistence seams.
//!
//! Used by the pool and cooperative schedulers when no database is
//! configured, and by tests. They honour the same contracts as the
//! PostgreSQL implementations: job updates go through [`Job::apply`]
//! atomically per job, and the queue redelivers messages whose lease expired.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use docflow_core::{
    AppliedUpdate, Batch, BatchCounts, BatchStatus, Delivery, DocumentRecord, DocumentStore, Error,
    FailureCategory, Job, JobRepository, JobStatus, JobUpdate, Result, StageError, StageOutcome,
    TaskPayload, TaskQueue,
};

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// [`JobRepository`] backed by concurrent maps.
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct MemoryJobRepository {
    inner: Arc<RepoInner>,
}

#[derive(Default)]
struct RepoInner {
    jobs: DashMap<Uuid, Job>,
    batches: DashMap<Uuid, Mutex<Batch>>,
    /// content_hash -> first job that succeeded with it
    succeeded: DashMap<String, Uuid>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.len()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()> {
        if self.inner.batches.contains_key(&batch.batch_id) {
            return Err(Error::InvalidInput(format!(
                "batch {} already exists",
                batch.batch_id
            )));
        }
        for job in jobs {
            self.inner.jobs.insert(job.id, job.clone());
            if job.status == JobStatus::Succeeded {
                self.inner
                    .succeeded
                    .entry(job.content_hash.clone())
                    .or_insert(job.id);
            }
        }
        let mut stored = batch.clone();
        stored.job_ids = jobs.iter().map(|j| j.id).collect();
        stored.counts = BatchCounts::from_statuses(jobs.iter().map(|j| j.status));
        self.inner
            .batches
            .insert(batch.batch_id, Mutex::new(stored));
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.jobs.get(&job_id).map(|j| j.clone()))
    }

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<AppliedUpdate> {
        let mut job = self
            .inner
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        let previous = job.apply(update)?;

        if job.status == JobStatus::Succeeded {
            self.inner
                .succeeded
                .entry(job.content_hash.clone())
                .or_insert(job.id);
        }

        if let Some(batch) = self.inner.batches.get(&job.batch_id) {
            let mut batch = batch.lock();
            batch.counts.transition(previous, job.status);
            if batch.counts.is_complete() && batch.status == BatchStatus::Open {
                batch.status = BatchStatus::Completed;
                batch.completed_at = Some(Utc::now());
            }
        }

        Ok(AppliedUpdate {
            previous,
            job: job.clone(),
        })
    }

    async fn find_succeeded_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>> {
        Ok(self.inner.succeeded.get(content_hash).map(|id| *id))
    }

    async fn list_for_batch(&self, batch_id: Uuid) -> Result<Vec<Job>> {
        let job_ids = match self.inner.batches.get(&batch_id) {
            Some(batch) => batch.lock().job_ids.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(job_ids
            .iter()
            .filter_map(|id| self.inner.jobs.get(id).map(|j| j.clone()))
            .collect())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        Ok(self
            .inner
            .batches
            .get(&batch_id)
            .map(|batch| batch.lock().clone()))
    }

    async fn processed_since(
        &self,
        batch_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let jobs = self.list_for_batch(batch_id).await?;
        Ok(jobs
            .into_iter()
            .filter(|j| matches!(j.status, JobStatus::Succeeded | JobStatus::Failed))
            .map(|j| j.updated_at)
            .filter(|at| *at >= since)
            .collect())
    }
}

// =============================================================================
// TASK QUEUE
// =============================================================================

struct QueuedMessage {
    delivery_id: Uuid,
    payload: TaskPayload,
    delivery_count: i32,
    visible_at: Instant,
    leased_until: Option<Instant>,
    batch_limit: Option<usize>,
}

impl QueuedMessage {
    fn new(payload: &TaskPayload, batch_limit: Option<usize>) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            payload: payload.clone(),
            delivery_count: 0,
            visible_at: Instant::now(),
            leased_until: None,
            batch_limit,
        }
    }

    fn is_leased(&self, now: Instant) -> bool {
        self.leased_until.is_some_and(|until| until > now)
    }
}

/// Lease-based [`TaskQueue`] held in memory.
///
/// Stands in for the durable broker in tests and single-host setups. Can be
/// switched offline to exercise broker outages.
#[derive(Clone)]
pub struct MemoryTaskQueue {
    messages: Arc<Mutex<VecDeque<QueuedMessage>>>,
    available: Arc<AtomicBool>,
    enqueued: Arc<AtomicUsize>,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(Mutex::new(VecDeque::new())),
            available: Arc::new(AtomicBool::new(true)),
            enqueued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A queue whose broker cannot be reached.
    pub fn unavailable() -> Self {
        let queue = Self::new();
        queue.set_available(false);
        queue
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages not yet acked (leased ones included).
    pub fn depth(&self) -> usize {
        self.messages.lock().len()
    }

    /// Messages of `batch_id` still on the queue.
    pub fn batch_depth(&self, batch_id: Uuid) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.payload.batch_id == batch_id)
            .count()
    }

    /// Total messages ever enqueued.
    pub fn enqueued_total(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::QueueUnavailable("memory queue is offline".into()))
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn enqueue(&self, payload: &TaskPayload) -> Result<Uuid> {
        self.ensure_available()?;
        let message = QueuedMessage::new(payload, None);
        let delivery_id = message.delivery_id;
        self.messages.lock().push_back(message);
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        Ok(delivery_id)
    }

    async fn enqueue_batch(
        &self,
        payloads: &[TaskPayload],
        max_in_flight: usize,
    ) -> Result<Vec<Uuid>> {
        self.ensure_available()?;
        let limit = Some(max_in_flight.max(1));
        let mut messages = self.messages.lock();
        let ids = payloads
            .iter()
            .map(|payload| {
                let message = QueuedMessage::new(payload, limit);
                let id = message.delivery_id;
                messages.push_back(message);
                id
            })
            .collect::<Vec<_>>();
        self.enqueued.fetch_add(ids.len(), Ordering::SeqCst);
        Ok(ids)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut messages = self.messages.lock();

        let mut leased: HashMap<Uuid, usize> = HashMap::new();
        for m in messages.iter().filter(|m| m.is_leased(now)) {
            *leased.entry(m.payload.batch_id).or_default() += 1;
        }
        let Some(message) = messages.iter_mut().find(|m| {
            m.visible_at <= now
                && m.batch_limit.map_or(true, |limit| {
                    leased.get(&m.payload.batch_id).copied().unwrap_or(0) < limit
                })
        }) else {
            return Ok(None);
        };
        message.delivery_count += 1;
        message.visible_at = now + lease;
        message.leased_until = Some(now + lease);
        Ok(Some(Delivery {
            delivery_id: message.delivery_id,
            payload: message.payload.clone(),
            delivery_count: message.delivery_count,
        }))
    }

    async fn purge_batch(&self, batch_id: Uuid) -> Result<u64> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|m| m.payload.batch_id != batch_id || m.is_leased(now));
        Ok((before - messages.len()) as u64)
    }

    async fn ack(&self, delivery_id: Uuid) -> Result<()> {
        self.ensure_available()?;
        self.messages
            .lock()
            .retain(|m| m.delivery_id != delivery_id);
        Ok(())
    }

    async fn nack(&self, delivery_id: Uuid, delay: Duration) -> Result<()> {
        self.ensure_available()?;
        let mut messages = self.messages.lock();
        if let Some(message) = messages.iter_mut().find(|m| m.delivery_id == delivery_id) {
            message.visible_at = Instant::now() + delay;
            message.leased_until = None;
        }
        Ok(())
    }
}

// =============================================================================
// DOCUMENT STORE
// =============================================================================

/// [`DocumentStore`] that keeps records in memory, keyed by job id.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    records: Arc<DashMap<Uuid, DocumentRecord>>,
    writes: Arc<AtomicUsize>,
    fail_next: Arc<AtomicUsize>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with a retryable storage error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, job_id: Uuid) -> Option<DocumentRecord> {
        self.records.get(&job_id).map(|r| r.clone())
    }

    /// Distinct documents stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Successful writes, overwrites included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn store(&self, record: &DocumentRecord) -> StageOutcome<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StageError::retryable(
                FailureCategory::Storage,
                "memory store write failed",
            ));
        }
        self.records.insert(record.job_id, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::{Classification, DocumentResult, Fingerprint, JobSpec};

    fn pending_batch(n: usize) -> (Batch, Vec<Job>) {
        let batch_id = Uuid::new_v4();
        let jobs: Vec<Job> = (0..n)
            .map(|i| {
                Job::new(
                    batch_id,
                    JobSpec::file(format!("/tmp/doc-{i}.txt")),
                    Fingerprint::strong(format!("sha256:{batch_id}-{i}")),
                )
            })
            .collect();
        (Batch::new(batch_id, Some("corr".into()), &jobs), jobs)
    }

    fn result() -> DocumentResult {
        DocumentResult {
            category: "report".into(),
            confidence: None,
            content_length: 3,
            embedding_dim: None,
            embedding_fallback: false,
        }
    }

    // =========================================================================
    // Job repository
    // =========================================================================

    #[tokio::test]
    async fn test_create_and_list_batch() {
        let repo = MemoryJobRepository::new();
        let (batch, jobs) = pending_batch(3);
        repo.create_batch(&batch, &jobs).await.unwrap();

        let listed = repo.list_for_batch(batch.batch_id).await.unwrap();
        assert_eq!(
            listed.iter().map(|j| j.id).collect::<Vec<_>>(),
            batch.job_ids
        );
        let loaded = repo.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded.counts.total, 3);
        assert_eq!(loaded.counts.pending, 3);

        assert!(repo.create_batch(&batch, &jobs).await.is_err());
    }

    #[tokio::test]
    async fn test_update_tracks_batch_completion() {
        let repo = MemoryJobRepository::new();
        let (batch, jobs) = pending_batch(2);
        repo.create_batch(&batch, &jobs).await.unwrap();

        repo.update(jobs[0].id, JobUpdate::Skip { duplicate_of: None })
            .await
            .unwrap();
        repo.update(jobs[1].id, JobUpdate::Start).await.unwrap();
        let loaded = repo.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded.counts.running, 1);
        assert_eq!(loaded.status, BatchStatus::Open);

        let applied = repo
            .update(
                jobs[1].id,
                JobUpdate::Succeed {
                    stage_index: 3,
                    result: result(),
                },
            )
            .await
            .unwrap();
        assert_eq!(applied.previous, JobStatus::Running);

        let loaded = repo.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded.counts.succeeded, 1);
        assert_eq!(loaded.counts.skipped, 1);
        assert_eq!(loaded.status, BatchStatus::Completed);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_find_succeeded_by_hash_ignores_failures() {
        let repo = MemoryJobRepository::new();
        let (batch, jobs) = pending_batch(1);
        repo.create_batch(&batch, &jobs).await.unwrap();
        repo.update(jobs[0].id, JobUpdate::Start).await.unwrap();
        repo.update(
            jobs[0].id,
            JobUpdate::Fail {
                stage_index: 0,
                error: StageError::unsupported_format("exe"),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            repo.find_succeeded_by_hash(&jobs[0].content_hash)
                .await
                .unwrap(),
            None
        );
        let processed = repo
            .processed_since(batch.batch_id, Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(processed.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_terminal_regression() {
        let repo = MemoryJobRepository::new();
        let (batch, jobs) = pending_batch(1);
        repo.create_batch(&batch, &jobs).await.unwrap();
        repo.update(jobs[0].id, JobUpdate::Skip { duplicate_of: None })
            .await
            .unwrap();

        let err = repo.update(jobs[0].id, JobUpdate::Start).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        let loaded = repo.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded.counts.skipped, 1);
        assert_eq!(loaded.counts.running, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let repo = MemoryJobRepository::new();
        let err = repo
            .update(Uuid::new_v4(), JobUpdate::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    // =========================================================================
    // Task queue
    // =========================================================================

    #[tokio::test]
    async fn test_queue_lease_ack_and_redelivery() {
        let queue = MemoryTaskQueue::new();
        let (_, jobs) = pending_batch(1);
        let payload = TaskPayload::for_job(&jobs[0]);
        queue.enqueue(&payload).await.unwrap();

        let first = queue
            .dequeue(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.delivery_count, 1);
        assert!(queue
            .dequeue(Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = queue
            .dequeue(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.delivery_id, first.delivery_id);
        assert_eq!(second.delivery_count, 2);

        queue.ack(second.delivery_id).await.unwrap();
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.enqueued_total(), 1);
    }

    #[tokio::test]
    async fn test_queue_nack_delays_visibility() {
        let queue = MemoryTaskQueue::new();
        let (_, jobs) = pending_batch(1);
        queue.enqueue(&TaskPayload::for_job(&jobs[0])).await.unwrap();

        let delivery = queue
            .dequeue(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue
            .nack(delivery.delivery_id, Duration::ZERO)
            .await
            .unwrap();
        let again = queue
            .dequeue(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_batch_limit_caps_leases() {
        let queue = MemoryTaskQueue::new();
        let (_, jobs) = pending_batch(4);
        let payloads: Vec<TaskPayload> = jobs.iter().map(TaskPayload::for_job).collect();
        queue.enqueue_batch(&payloads, 2).await.unwrap();
        assert_eq!(queue.enqueued_total(), 4);

        let lease = Duration::from_secs(60);
        let first = queue.dequeue(lease).await.unwrap().unwrap();
        let _second = queue.dequeue(lease).await.unwrap().unwrap();
        assert!(queue.dequeue(lease).await.unwrap().is_none());

        // A nacked delivery waiting out its delay no longer holds a lease.
        queue.nack(first.delivery_id, Duration::from_secs(60)).await.unwrap();
        assert!(queue.dequeue(lease).await.unwrap().is_some());
        assert!(queue.dequeue(lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_keeps_leased_messages() {
        let queue = MemoryTaskQueue::new();
        let (batch, jobs) = pending_batch(3);
        let payloads: Vec<TaskPayload> = jobs.iter().map(TaskPayload::for_job).collect();
        queue.enqueue_batch(&payloads, 3).await.unwrap();
        let leased = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();

        assert_eq!(queue.purge_batch(batch.batch_id).await.unwrap(), 2);
        assert_eq!(queue.batch_depth(batch.batch_id), 1);
        queue.ack(leased.delivery_id).await.unwrap();
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_queue() {
        let queue = MemoryTaskQueue::unavailable();
        assert!(matches!(
            queue.health_check().await,
            Err(Error::QueueUnavailable(_))
        ));
        queue.set_available(true);
        assert!(queue.health_check().await.is_ok());
    }

    // =========================================================================
    // Document store
    // =========================================================================

    #[tokio::test]
    async fn test_document_store_overwrites_by_job_id() {
        let store = MemoryDocumentStore::new();
        let (batch, jobs) = pending_batch(1);
        let mut record = DocumentRecord {
            job_id: jobs[0].id,
            batch_id: batch.batch_id,
            source_ref: jobs[0].source_ref.clone(),
            content_hash: jobs[0].content_hash.clone(),
            text: "abc".into(),
            content_type: "text/plain".into(),
            classification: Classification {
                category: "report".into(),
                confidence: None,
            },
            embedding: None,
            embedding_fallback: false,
        };

        store.fail_next(1);
        assert!(store.store(&record).await.is_err());
        store.store(&record).await.unwrap();
        record.classification.category = "invoice".into();
        store.store(&record).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count(), 2);
        assert_eq!(
            store.get(jobs[0].id).unwrap().classification.category,
            "invoice"
        );
    }
}
