//! Shared setup for engine integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docflow_inference::mock::MockClassifier;
use docflow_jobs::{
    EngineConfig, MemoryDocumentStore, MemoryJobRepository, PipelineEngine, ProgressSnapshot,
    RetryPolicy, Strategy, TaskQueue,
};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(10);

/// Config with millisecond backoff and polling.
pub fn fast_config(strategy: Strategy) -> EngineConfig {
    EngineConfig::default()
        .with_strategy(strategy)
        .with_workers(2)
        .with_chunk_size(2)
        .with_retry(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ))
        .with_stage_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(10))
}

/// In-memory engine plus handles on its collaborators.
pub struct TestEngine {
    pub dir: TempDir,
    pub engine: PipelineEngine,
    pub repo: MemoryJobRepository,
    pub store: MemoryDocumentStore,
    pub classifier: MockClassifier,
}

pub async fn engine_with(config: EngineConfig, classifier: MockClassifier) -> TestEngine {
    engine_with_queue(config, classifier, None).await
}

pub async fn engine_with_queue(
    config: EngineConfig,
    classifier: MockClassifier,
    queue: Option<Arc<dyn TaskQueue>>,
) -> TestEngine {
    let repo = MemoryJobRepository::new();
    let store = MemoryDocumentStore::new();
    let mut builder = PipelineEngine::builder(config)
        .with_jobs(Arc::new(repo.clone()))
        .with_store(Arc::new(store.clone()))
        .with_classifier(Arc::new(classifier.clone()));
    if let Some(queue) = queue {
        builder = builder.with_queue(queue);
    }
    let engine = builder.build().await.expect("engine should build");
    TestEngine {
        dir: tempfile::tempdir().expect("tempdir"),
        engine,
        repo,
        store,
        classifier,
    }
}

impl TestEngine {
    /// Write `n` text files with distinct content.
    pub fn write_files(&self, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| self.write(&format!("doc-{i}.txt"), &format!("document number {i}")))
            .collect()
    }

    pub fn write(&self, name: &str, body: &str) -> PathBuf {
        write_file(self.dir.path(), name, body)
    }

    pub async fn wait(&self, batch_id: uuid::Uuid) -> ProgressSnapshot {
        tokio::time::timeout(WAIT, self.engine.wait_for_batch(batch_id))
            .await
            .expect("batch did not settle in time")
            .expect("wait_for_batch failed")
    }
}

pub fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write test file");
    path
}

/// Poll `check` until it returns true.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn assert_counts_consistent(snapshot: &ProgressSnapshot) {
    assert_eq!(
        snapshot.total,
        snapshot.succeeded + snapshot.failed + snapshot.skipped + snapshot.pending,
        "counters out of balance: {snapshot:?}"
    );
}
