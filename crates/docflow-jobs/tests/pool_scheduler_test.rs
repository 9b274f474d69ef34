//! End-to-end tests for the engine running on the thread-pool scheduler.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use docflow_core::{
    Batch, ErrorKind, FailureCategory, Fingerprint, Job, JobRepository, JobSpec, JobStatus,
    StageError,
};
use docflow_inference::mock::MockClassifier;
use docflow_jobs::{
    EngineBuilder, Error, MemoryJobRepository, PipelineEvent, PoolScheduler, Scheduler, Strategy,
};
use helpers::{assert_counts_consistent, engine_with, fast_config, wait_until};
use tokio::sync::Semaphore;

// =============================================================================
// Basic processing
// =============================================================================

#[tokio::test]
async fn test_pool_processes_unique_files() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let files = t.write_files(5);

    let handle = t
        .engine
        .submit_batch(files.into_iter().map(JobSpec::file).collect(), None)
        .await
        .unwrap();
    assert_eq!(handle.dispatched, 5);

    let snapshot = t.wait(handle.batch_id).await;
    assert_eq!(snapshot.total, 5);
    assert_eq!(snapshot.succeeded, 5);
    assert!(snapshot.is_complete());
    assert_counts_consistent(&snapshot);
    assert_eq!(t.store.len(), 5);

    for job in t.engine.jobs_for_batch(handle.batch_id).await.unwrap() {
        assert!(job.is_terminal());
        assert_eq!(job.attempt_count, 1);
    }
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_directory() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    t.write_files(3);
    std::fs::create_dir(t.dir.path().join("nested")).unwrap();
    helpers::write_file(&t.dir.path().join("nested"), "deep.txt", "deep content");

    let flat = t
        .engine
        .submit_directory(t.dir.path(), false, Some("upload-1".into()))
        .await
        .unwrap();
    assert_eq!(flat.job_ids.len(), 3);
    let snapshot = t.wait(flat.batch_id).await;
    assert_eq!(snapshot.correlation_id.as_deref(), Some("upload-1"));
    assert_eq!(snapshot.succeeded, 3);

    // The three top-level files already succeeded and are skipped now.
    let deep = t
        .engine
        .submit_directory(t.dir.path(), true, None)
        .await
        .unwrap();
    assert_eq!(deep.job_ids.len(), 4);
    assert_eq!(deep.skipped, 3);
    let snapshot = t.wait(deep.batch_id).await;
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.skipped, 3);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_file_returns_job_handle() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let path = t.write("single.md", "# heading");

    let handle = t.engine.submit_file(&path).await.unwrap();
    assert!(!handle.skipped);
    t.wait(handle.batch_id).await;

    let job = t.engine.job(handle.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.batch_id, handle.batch_id);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_submissions_rejected() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;

    let err = t.engine.submit_batch(Vec::new(), None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let empty = tempfile::tempdir().unwrap();
    let err = t
        .engine
        .submit_directory(empty.path(), true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    t.engine.shutdown().await.unwrap();
}

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test]
async fn test_same_file_twice_in_one_batch() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let path = t.write("dup.txt", "the same bytes");

    let handle = t
        .engine
        .submit_batch(vec![JobSpec::file(&path), JobSpec::file(&path)], None)
        .await
        .unwrap();
    assert_eq!(handle.skipped, 1);
    assert_eq!(handle.dispatched, 1);

    let snapshot = t.wait(handle.batch_id).await;
    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.skipped, 1);

    let first = t.engine.job(handle.job_ids[0]).await.unwrap().unwrap();
    let second = t.engine.job(handle.job_ids[1]).await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Succeeded);
    assert_eq!(second.status, JobStatus::Skipped);
    assert_eq!(second.duplicate_of, Some(first.id));
    assert_eq!(t.classifier.call_count(), 1);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_identical_content_across_batches_is_skipped() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let original = t.write("a.txt", "shared content");
    let copy = t.write("b.txt", "shared content");

    let first = t.engine.submit_file(&original).await.unwrap();
    t.wait(first.batch_id).await;

    let second = t.engine.submit_file(&copy).await.unwrap();
    assert!(second.skipped);
    let snapshot = t.wait(second.batch_id).await;
    assert_eq!(snapshot.skipped, 1);

    let job = t.engine.job(second.job_id).await.unwrap().unwrap();
    assert_eq!(job.duplicate_of, Some(first.job_id));
    assert_eq!(t.store.write_count(), 1);

    // Forced resubmission bypasses dedup.
    let forced = t
        .engine
        .submit_batch(vec![JobSpec::file(&copy).with_force(true)], None)
        .await
        .unwrap();
    assert_eq!(forced.skipped, 0);
    let snapshot = t.wait(forced.batch_id).await;
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(t.store.write_count(), 2);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_fingerprint_is_not_a_dedup_entry() {
    let classifier = MockClassifier::new().with_failure_for(
        "reject-me",
        StageError::terminal(FailureCategory::Classification, "bad request"),
    );
    let t = engine_with(fast_config(Strategy::Pool), classifier).await;
    let path = t.write("bad.txt", "reject-me please");

    let first = t.engine.submit_file(&path).await.unwrap();
    assert_eq!(t.wait(first.batch_id).await.failed, 1);

    let again = t.engine.submit_file(&path).await.unwrap();
    assert!(!again.skipped);
    assert_eq!(t.wait(again.batch_id).await.failed, 1);
    assert_eq!(t.classifier.call_count(), 2);
    t.engine.shutdown().await.unwrap();
}

// =============================================================================
// Failures and retries
// =============================================================================

#[tokio::test]
async fn test_retryable_error_then_success() {
    let classifier =
        MockClassifier::new().with_script([Err(StageError::service_unavailable("cold start"))]);
    let t = engine_with(fast_config(Strategy::Pool), classifier).await;
    let path = t.write("retry.txt", "try me twice");

    let handle = t.engine.submit_file(&path).await.unwrap();
    let snapshot = t.wait(handle.batch_id).await;
    assert_eq!(snapshot.succeeded, 1);

    let job = t.engine.job(handle.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt_count, 2);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_terminal_extraction_error_skips_later_stages() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let path = t.write("setup.exe", "MZ binary");

    let handle = t.engine.submit_file(&path).await.unwrap();
    let snapshot = t.wait(handle.batch_id).await;
    assert_eq!(snapshot.failed, 1);
    assert!(snapshot.has_failures());

    let job = t.engine.job(handle.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.stage_index, 0);
    let error = job.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Terminal);
    assert_eq!(error.category, FailureCategory::Extraction);
    assert_eq!(t.classifier.call_count(), 0);
    assert!(t.store.is_empty());
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_stage_leaves_no_later_output() {
    let classifier = MockClassifier::new().with_failure_for(
        "unclassifiable",
        StageError::terminal(FailureCategory::Classification, "no category fits"),
    );
    let t = engine_with(fast_config(Strategy::Pool), classifier).await;
    let good = t.write("good.txt", "fine content");
    let bad = t.write("bad.txt", "unclassifiable content");

    let handle = t
        .engine
        .submit_batch(vec![JobSpec::file(good), JobSpec::file(bad)], None)
        .await
        .unwrap();
    let snapshot = t.wait(handle.batch_id).await;
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.failed, 1);
    assert_counts_consistent(&snapshot);

    let failed = t.engine.job(handle.job_ids[1]).await.unwrap().unwrap();
    assert_eq!(failed.stage_index, 1);
    assert!(failed.result.is_none());
    assert!(t.store.get(failed.id).is_none());
    assert!(t.store.get(handle.job_ids[0]).is_some());
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let classifier = MockClassifier::new().with_failure_for(
        "flaky",
        StageError::rate_limited("slow down"),
    );
    let t = engine_with(fast_config(Strategy::Pool), classifier).await;
    let path = t.write("flaky.txt", "flaky upstream");

    let handle = t.engine.submit_file(&path).await.unwrap();
    t.wait(handle.batch_id).await;

    let job = t.engine.job(handle.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.last_error.unwrap().category, FailureCategory::RateLimited);
    t.engine.shutdown().await.unwrap();
}

// =============================================================================
// Worker crashes
// =============================================================================

#[tokio::test]
async fn test_worker_crash_is_retried() {
    let config = fast_config(Strategy::Pool).with_workers(1).with_chunk_size(4);
    let t = engine_with(config, MockClassifier::new().with_panic_on("boom", 1)).await;
    let crashing = t.write("0-boom.txt", "boom goes the worker");
    let mut specs = vec![JobSpec::file(crashing)];
    specs.extend(t.write_files(3).into_iter().map(JobSpec::file));

    let handle = t.engine.submit_batch(specs, None).await.unwrap();
    let snapshot = t.wait(handle.batch_id).await;
    assert_eq!(snapshot.succeeded, 4);

    let crashed = t.engine.job(handle.job_ids[0]).await.unwrap().unwrap();
    assert_eq!(crashed.attempt_count, 2);
    for id in &handle.job_ids[1..] {
        let job = t.engine.job(*id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_crash_fails_job() {
    let config = fast_config(Strategy::Pool).with_workers(2);
    let t = engine_with(config, MockClassifier::new().with_panic_on("doom", 100)).await;
    let doomed = t.write("doom.txt", "doom every time");
    let fine = t.write("fine.txt", "nothing to see");

    let handle = t
        .engine
        .submit_batch(vec![JobSpec::file(doomed), JobSpec::file(fine)], None)
        .await
        .unwrap();
    let snapshot = t.wait(handle.batch_id).await;
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.succeeded, 1);

    let job = t.engine.job(handle.job_ids[0]).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 3);
    assert_eq!(
        job.last_error.unwrap().category,
        FailureCategory::WorkerCrash
    );
    t.engine.shutdown().await.unwrap();
}

// =============================================================================
// Startup
// =============================================================================

fn pool_runner(repo: &MemoryJobRepository, classifier: MockClassifier) -> docflow_jobs::JobRunner {
    EngineBuilder::new(fast_config(Strategy::Pool))
        .with_jobs(Arc::new(repo.clone()))
        .with_classifier(Arc::new(classifier))
        .into_runner()
        .unwrap()
}

#[tokio::test]
async fn test_pool_starts_every_worker() {
    let repo = MemoryJobRepository::new();
    let pool = PoolScheduler::start(
        pool_runner(&repo, MockClassifier::new()),
        3,
        1,
        Duration::from_millis(10),
    )
    .unwrap();
    assert_eq!(pool.workers(), 3);
    assert_eq!(pool.live_workers(), 3);

    pool.shutdown().await.unwrap();
    assert_eq!(pool.live_workers(), 0);
}

#[tokio::test]
async fn test_pool_without_workers_is_rejected() {
    let repo = MemoryJobRepository::new();
    let result = PoolScheduler::start(
        pool_runner(&repo, MockClassifier::new()),
        0,
        1,
        Duration::from_millis(10),
    );
    assert!(matches!(result, Err(Error::WorkerPool(_))));
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let repo = MemoryJobRepository::new();
    let runner = pool_runner(&repo, MockClassifier::new().with_panic_on("boom", 1));
    let pool = PoolScheduler::start(runner.clone(), 1, 1, Duration::from_millis(10)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = helpers::write_file(dir.path(), "boom.txt", "boom goes the worker");
    let batch_id = docflow_core::new_v7();
    let jobs = vec![Job::new(
        batch_id,
        JobSpec::file(path),
        Fingerprint::strong("sha256:boom"),
    )];
    let batch = Batch::new(batch_id, None, &jobs);
    repo.create_batch(&batch, &jobs).await.unwrap();
    runner.publisher().register(&batch, &jobs);

    assert_eq!(pool.submit(batch_id, &jobs).await.unwrap(), 1);
    let snapshot = tokio::time::timeout(helpers::WAIT, pool.wait_for_batch(batch_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(pool.live_workers(), 1);
    pool.shutdown().await.unwrap();
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_pool_cancel_keeps_undispatched_jobs_pending() {
    let gate = Arc::new(Semaphore::new(0));
    let classifier = MockClassifier::new().with_gate(Arc::clone(&gate));
    let config = fast_config(Strategy::Pool).with_workers(2).with_chunk_size(1);
    let t = engine_with(config, classifier).await;
    let files = t.write_files(10);

    let handle = t
        .engine
        .submit_batch(files.into_iter().map(JobSpec::file).collect(), None)
        .await
        .unwrap();
    let batch_id = handle.batch_id;

    let engine = &t.engine;
    let classifier = &t.classifier;
    wait_until(|| async move {
        let snapshot = engine.progress(batch_id).await.unwrap();
        snapshot.running == 2 && classifier.call_count() == 2
    })
    .await;

    t.engine.cancel(batch_id).await.unwrap();
    gate.add_permits(10);

    let snapshot = t.wait(batch_id).await;
    assert_eq!(snapshot.total, 10);
    assert_eq!(snapshot.succeeded, 2);
    assert_eq!(snapshot.pending, 8);
    assert!(!snapshot.is_complete());
    assert_counts_consistent(&snapshot);

    // Workers drain the cancelled batch's queued jobs without running them.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(t.classifier.call_count(), 2);
    let untouched = t
        .engine
        .jobs_for_batch(batch_id)
        .await
        .unwrap()
        .iter()
        .filter(|j| j.status == JobStatus::Pending && j.attempt_count == 0)
        .count();
    assert_eq!(untouched, 8);
    t.engine.shutdown().await.unwrap();
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test]
async fn test_settled_batches_are_evicted() {
    let config = fast_config(Strategy::Pool).with_batch_retention(Duration::ZERO);
    let t = engine_with(config, MockClassifier::new()).await;

    let first = t.engine.submit_file(t.write("a.txt", "first")).await.unwrap();
    t.wait(first.batch_id).await;
    assert_eq!(t.engine.tracked_batches(), 1);

    // The next submission sweeps the finished batch.
    let second = t.engine.submit_file(t.write("b.txt", "second")).await.unwrap();
    assert!(t.engine.job_statuses(first.batch_id).is_none());
    t.wait(second.batch_id).await;
    assert_eq!(t.engine.evict_expired(), 1);
    assert_eq!(t.engine.tracked_batches(), 0);

    // Evicted batches are still answered from the job repository.
    let snapshot = t.engine.progress(first.batch_id).await.unwrap();
    assert_eq!(snapshot.succeeded, 1);
    assert!(snapshot.is_complete());
    assert_eq!(t.engine.wait_for_batch(second.batch_id).await.unwrap().succeeded, 1);
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_batch_is_evicted_once_drained() {
    let gate = Arc::new(Semaphore::new(0));
    let classifier = MockClassifier::new().with_gate(Arc::clone(&gate));
    let config = fast_config(Strategy::Pool)
        .with_workers(2)
        .with_chunk_size(1)
        .with_batch_retention(Duration::ZERO);
    let t = engine_with(config, classifier).await;
    let files = t.write_files(6);

    let handle = t
        .engine
        .submit_batch(files.into_iter().map(JobSpec::file).collect(), None)
        .await
        .unwrap();
    let classifier = &t.classifier;
    wait_until(|| async move { classifier.call_count() == 2 }).await;

    t.engine.cancel(handle.batch_id).await.unwrap();
    // Two jobs are still running.
    assert_eq!(t.engine.evict_expired(), 0);
    assert_eq!(t.engine.tracked_batches(), 1);

    gate.add_permits(10);
    t.wait(handle.batch_id).await;
    let engine = &t.engine;
    wait_until(|| async move {
        engine.evict_expired();
        engine.tracked_batches() == 0
    })
    .await;

    let snapshot = t.engine.progress(handle.batch_id).await.unwrap();
    assert_eq!(snapshot.succeeded, 2);
    assert_eq!(snapshot.pending, 4);
    t.engine.shutdown().await.unwrap();
}

// =============================================================================
// Progress and events
// =============================================================================

#[tokio::test]
async fn test_batch_events_end_with_completion() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let files = t.write_files(3);

    // Subscribe before submitting so no transition is missed.
    let mut events = t.engine.subscribe();
    let handle = t
        .engine
        .submit_batch(files.into_iter().map(JobSpec::file).collect(), None)
        .await
        .unwrap();

    let mut transitions = 0;
    let snapshot = loop {
        let envelope = tokio::time::timeout(helpers::WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload.batch_id(), handle.batch_id);
        match envelope.payload {
            PipelineEvent::JobTransition { .. } => transitions += 1,
            PipelineEvent::BatchCompleted { snapshot } => break snapshot,
        }
    };
    assert_eq!(snapshot.succeeded, 3);
    // Pending -> Running -> Succeeded for each job.
    assert_eq!(transitions, 6);

    let statuses = t.engine.job_statuses(handle.batch_id).unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.iter().all(|(_, s)| *s == JobStatus::Succeeded));
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_progress_by_correlation_spans_batches() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let first = t
        .engine
        .submit_batch(
            vec![
                JobSpec::file(t.write("a.txt", "alpha")),
                JobSpec::file(t.write("b.txt", "beta")),
            ],
            Some("upload-7".into()),
        )
        .await
        .unwrap();
    t.wait(first.batch_id).await;
    let second = t
        .engine
        .submit_batch(
            vec![
                JobSpec::file(t.write("c.txt", "gamma")),
                JobSpec::file(t.write("a-copy.txt", "alpha")),
            ],
            Some("upload-7".into()),
        )
        .await
        .unwrap();
    let other = t
        .engine
        .submit_batch(vec![JobSpec::file(t.write("d.txt", "delta"))], Some("other".into()))
        .await
        .unwrap();
    t.wait(second.batch_id).await;
    t.wait(other.batch_id).await;

    let progress = t
        .engine
        .progress_by_correlation("upload-7")
        .await
        .unwrap()
        .unwrap();
    let mut expected = vec![first.batch_id, second.batch_id];
    expected.sort();
    assert_eq!(progress.batch_ids, expected);
    assert_eq!(progress.total, 4);
    assert_eq!(progress.succeeded, 3);
    assert_eq!(progress.skipped, 1);
    assert_eq!(progress.pending, 0);
    assert!(progress.is_complete());

    assert!(t
        .engine
        .progress_by_correlation("nobody")
        .await
        .unwrap()
        .is_none());
    t.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_progress_for_unknown_batch() {
    let t = engine_with(fast_config(Strategy::Pool), MockClassifier::new()).await;
    let err = t.engine.progress(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::BatchNotFound(_)));
    t.engine.shutdown().await.unwrap();
}
