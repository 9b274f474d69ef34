//! Mock classification and embedding collaborators for deterministic testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docflow_inference::mock::{MockClassifier, MockEmbedder};
//!
//! let classifier = MockClassifier::new()
//!     .with_category("report")
//!     .with_script([Err(StageError::service_unavailable("warming up"))]);
//! let embedder = MockEmbedder::new(8);
//! ```
//!
//! Scripted outcomes are consumed in call order before falling back to the
//! default behaviour, so "fail once, then succeed" is one `with_script` call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use docflow_core::{
    Classification, Classifier, Embedder, ExtractedContent, FailureCategory, StageError,
    StageOutcome,
};

/// Tracks concurrent calls so tests can assert concurrency bounds.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock [`Classifier`] with a call log and scripted failures.
///
/// Clones share the script, call log and counters.
#[derive(Clone)]
pub struct MockClassifier {
    category: String,
    confidence: Option<f32>,
    latency: Duration,
    /// Texts containing the marker always fail with the given error.
    failures: Vec<(String, StageError)>,
    gate: Option<Arc<Semaphore>>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<StageOutcome<Classification>>>,
    /// Texts containing the marker panic, up to the remaining count.
    panics: Mutex<Vec<(String, usize)>>,
    calls: Mutex<Vec<String>>,
    in_flight: InFlight,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self {
            category: "other".to_string(),
            confidence: None,
            latency: Duration::ZERO,
            failures: Vec::new(),
            gate: None,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Category returned by default.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Simulated latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Outcomes returned by the first calls, in order.
    pub fn with_script<I>(self, outcomes: I) -> Self
    where
        I: IntoIterator<Item = StageOutcome<Classification>>,
    {
        self.shared.script.lock().extend(outcomes);
        self
    }

    /// Always fail for content containing `marker`.
    pub fn with_failure_for(mut self, marker: impl Into<String>, error: StageError) -> Self {
        self.failures.push((marker.into(), error));
        self
    }

    /// Panic on the first `times` calls whose content contains `marker`.
    pub fn with_panic_on(self, marker: impl Into<String>, times: usize) -> Self {
        self.shared.panics.lock().push((marker.into(), times));
        self
    }

    /// Each call must take one permit from `gate` before returning.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Texts seen so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.shared.calls.lock().len()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.in_flight.max.load(Ordering::SeqCst)
    }

    fn should_panic(&self, text: &str) -> bool {
        let mut panics = self.shared.panics.lock();
        for (marker, remaining) in panics.iter_mut() {
            if *remaining > 0 && text.contains(marker.as_str()) {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    async fn respond(&self, text: &str) -> StageOutcome<Classification> {
        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(StageError::service_unavailable("mock gate closed")),
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.should_panic(text) {
            panic!("mock classifier panic");
        }
        if let Some(outcome) = self.shared.script.lock().pop_front() {
            return outcome;
        }
        if let Some((_, error)) = self
            .failures
            .iter()
            .find(|(marker, _)| text.contains(marker.as_str()))
        {
            return Err(error.clone());
        }
        Ok(Classification {
            category: self.category.clone(),
            confidence: self.confidence,
        })
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter even when the call panics.
struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, content: &ExtractedContent) -> StageOutcome<Classification> {
        self.shared.calls.lock().push(content.text.clone());
        self.shared.in_flight.enter();
        let _guard = InFlightGuard(&self.shared.in_flight);
        self.respond(&content.text).await
    }

    fn model_name(&self) -> &str {
        "mock-classifier"
    }
}

/// Mock [`Embedder`] producing deterministic vectors.
#[derive(Clone)]
pub struct MockEmbedder {
    dimension: usize,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call fails with a retryable embedding error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Deterministic unit vector derived from character codes.
    pub fn vector_for(text: &str, dimension: usize) -> Vec<f32> {
        let mut vec = vec![0.0f32; dimension];
        if dimension == 0 {
            return vec;
        }
        for (i, c) in text.chars().enumerate() {
            vec[(c as usize + i) % dimension] += 0.1;
        }
        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vec.iter_mut().for_each(|x| *x /= norm);
        }
        vec
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> StageOutcome<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StageError::retryable(
                FailureCategory::Embedding,
                "mock embedder unavailable",
            ));
        }
        Ok(Self::vector_for(text, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}
