//! The stage pipeline: Extract, Classify, optional Embed, Store.
//!
//! Stages run strictly in order. Each receives the accumulated
//! [`PipelineState`] and returns it extended with its own output, or a
//! [`StageError`]. The first error stops the run; later stages never execute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{trace, warn};

use docflow_core::{
    logging, Classification, Classifier, DocumentRecord, DocumentResult, DocumentStore, Embedder,
    EmbeddingOutput, ExtractedContent, Extractor, FailureCategory, Job, StageError, StageOutcome,
};

use crate::rate_limit::ServiceLimiter;

/// Outputs accumulated while a job moves through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub content: Option<ExtractedContent>,
    pub classification: Option<Classification>,
    pub embedding: Option<EmbeddingOutput>,
    pub result: Option<DocumentResult>,
}

impl PipelineState {
    fn content(&self, stage: &str) -> StageOutcome<&ExtractedContent> {
        self.content.as_ref().ok_or_else(|| missing_input(stage, "extracted content"))
    }

    fn classification(&self, stage: &str) -> StageOutcome<&Classification> {
        self.classification
            .as_ref()
            .ok_or_else(|| missing_input(stage, "classification"))
    }
}

fn missing_input(stage: &str, what: &str) -> StageError {
    StageError::terminal(
        FailureCategory::Storage,
        format!("stage '{stage}' ran without {what}"),
    )
    .in_stage(stage)
}

/// One named pipeline step.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wait for admission (service rate limit) before `run`. The stage
    /// timeout does not cover this wait.
    async fn admit(&self, _job: &Job) {}

    async fn run(&self, job: &Job, state: PipelineState) -> StageOutcome<PipelineState>;
}

// =============================================================================
// STAGES
// =============================================================================

pub struct ExtractStage {
    extractor: Arc<dyn Extractor>,
}

impl ExtractStage {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> &'static str {
        "extract"
    }

    async fn run(&self, job: &Job, mut state: PipelineState) -> StageOutcome<PipelineState> {
        state.content = Some(self.extractor.extract(job).await?);
        Ok(state)
    }
}

/// Classify stage; waits on the shared service limiter before each request.
pub struct ClassifyStage {
    classifier: Arc<dyn Classifier>,
    limiter: ServiceLimiter,
}

impl ClassifyStage {
    pub fn new(classifier: Arc<dyn Classifier>, limiter: ServiceLimiter) -> Self {
        Self {
            classifier,
            limiter,
        }
    }
}

#[async_trait]
impl Stage for ClassifyStage {
    fn name(&self) -> &'static str {
        "classify"
    }

    async fn admit(&self, _job: &Job) {
        self.limiter.acquire().await;
    }

    async fn run(&self, _job: &Job, mut state: PipelineState) -> StageOutcome<PipelineState> {
        let content = state.content(self.name())?;
        let classification = self.classifier.classify(content).await?;
        state.classification = Some(classification);
        Ok(state)
    }
}

/// Embed stage.
///
/// Skipped when the job's params disable embedding. Embedder failures do not
/// fail the job: a zero vector of the embedder's dimension is substituted and
/// flagged as a fallback.
pub struct EmbedStage {
    embedder: Arc<dyn Embedder>,
    limiter: ServiceLimiter,
}

impl EmbedStage {
    pub fn new(embedder: Arc<dyn Embedder>, limiter: ServiceLimiter) -> Self {
        Self { embedder, limiter }
    }
}

#[async_trait]
impl Stage for EmbedStage {
    fn name(&self) -> &'static str {
        "embed"
    }

    async fn admit(&self, job: &Job) {
        if job.params.embed {
            self.limiter.acquire().await;
        }
    }

    async fn run(&self, job: &Job, mut state: PipelineState) -> StageOutcome<PipelineState> {
        if !job.params.embed {
            return Ok(state);
        }
        let content = state.content(self.name())?;
        let embedding = match self.embedder.embed(&content.text).await {
            Ok(vector) => EmbeddingOutput {
                vector,
                fallback: false,
            },
            Err(e) => {
                warn!(
                    subsystem = "pipeline",
                    job_id = %job.id,
                    model = self.embedder.model_name(),
                    error = %e,
                    "Embedding failed, using zero-vector fallback"
                );
                EmbeddingOutput::zero(self.embedder.dimension())
            }
        };
        state.embedding = Some(embedding);
        Ok(state)
    }
}

pub struct StoreStage {
    store: Arc<dyn DocumentStore>,
}

impl StoreStage {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for StoreStage {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn run(&self, job: &Job, mut state: PipelineState) -> StageOutcome<PipelineState> {
        let content = state.content(self.name())?;
        let classification = state.classification(self.name())?;
        let record = DocumentRecord {
            job_id: job.id,
            batch_id: job.batch_id,
            source_ref: job.source_ref.clone(),
            content_hash: job.content_hash.clone(),
            text: content.text.clone(),
            content_type: content.content_type.clone(),
            classification: classification.clone(),
            embedding: state.embedding.as_ref().map(|e| e.vector.clone()),
            embedding_fallback: state.embedding.as_ref().is_some_and(|e| e.fallback),
        };
        self.store.store(&record).await?;
        state.result = Some(DocumentResult::from_record(&record));
        Ok(state)
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Collaborators the standard pipeline is assembled from.
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn Extractor>,
    pub classifier: Arc<dyn Classifier>,
    /// No Embed stage when absent.
    pub embedder: Option<Arc<dyn Embedder>>,
    pub store: Arc<dyn DocumentStore>,
}

/// Record of one stage invocation. Discarded once the run is recorded on
/// the job.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage_name: &'static str,
    pub duration: Duration,
    pub error: Option<StageError>,
}

/// Where and why a run stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub stage_index: i32,
    pub error: StageError,
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub stages: Vec<StageResult>,
    pub outcome: Result<DocumentResult, StageFailure>,
}

impl PipelineRun {
    /// Index of the last stage that ran.
    pub fn last_stage_index(&self) -> i32 {
        self.stages.len().saturating_sub(1) as i32
    }
}

/// Ordered list of stages with a per-stage timeout.
pub struct StagePipeline {
    stages: Vec<Arc<dyn Stage>>,
    stage_timeout: Duration,
}

impl StagePipeline {
    /// Empty pipeline; add stages with [`StagePipeline::with_stage`].
    pub fn new(stage_timeout: Duration) -> Self {
        Self {
            stages: Vec::new(),
            stage_timeout,
        }
    }

    /// Extract, Classify, Embed (when an embedder is given), Store.
    pub fn standard(
        collaborators: Collaborators,
        limiter: ServiceLimiter,
        stage_timeout: Duration,
    ) -> Self {
        let mut pipeline = Self::new(stage_timeout)
            .with_stage(ExtractStage::new(collaborators.extractor))
            .with_stage(ClassifyStage::new(
                collaborators.classifier,
                limiter.clone(),
            ));
        if let Some(embedder) = collaborators.embedder {
            pipeline = pipeline.with_stage(EmbedStage::new(embedder, limiter));
        }
        pipeline.with_stage(StoreStage::new(collaborators.store))
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    /// Run `job` through every stage.
    pub async fn run(&self, job: &Job) -> PipelineRun {
        let timeout = job
            .params
            .stage_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.stage_timeout);

        let mut state = PipelineState::default();
        let mut stages = Vec::with_capacity(self.stages.len());

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name();
            stage.admit(job).await;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, stage.run(job, state)).await {
                Ok(result) => result.map_err(|e| e.in_stage(name)),
                Err(_) => Err(StageError::timeout(name, timeout)),
            };
            let duration = started.elapsed();

            match outcome {
                Ok(next) => {
                    trace!(
                        subsystem = "pipeline",
                        job_id = %job.id,
                        stage = name,
                        duration_ms = logging::millis(duration),
                        "Stage completed"
                    );
                    stages.push(StageResult {
                        stage_name: name,
                        duration,
                        error: None,
                    });
                    state = next;
                }
                Err(error) => {
                    trace!(
                        subsystem = "pipeline",
                        job_id = %job.id,
                        stage = name,
                        duration_ms = logging::millis(duration),
                        error = %error,
                        "Stage failed"
                    );
                    stages.push(StageResult {
                        stage_name: name,
                        duration,
                        error: Some(error.clone()),
                    });
                    return PipelineRun {
                        stages,
                        outcome: Err(StageFailure {
                            stage_index: index as i32,
                            error,
                        }),
                    };
                }
            }
        }

        let outcome = match state.result {
            Some(result) => Ok(result),
            None => Err(StageFailure {
                stage_index: stages.len().saturating_sub(1) as i32,
                error: StageError::terminal(
                    FailureCategory::Storage,
                    "pipeline finished without storing a result",
                ),
            }),
        };
        PipelineRun { stages, outcome }
    }
}
