//! Ollama classification and embedding backend.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use docflow_core::{
    defaults, logging, Classification, Classifier, Embedder, Error, ExtractedContent,
    FailureCategory, Result, StageError, StageOutcome,
};

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = defaults::OLLAMA_URL;

/// Default embedding model.
pub const DEFAULT_EMBED_MODEL: &str = defaults::EMBED_MODEL;

/// Default classification model.
pub const DEFAULT_GEN_MODEL: &str = defaults::GEN_MODEL;

/// Default embedding dimension for nomic-embed-text.
pub const DEFAULT_DIMENSION: usize = defaults::EMBED_DIMENSION;

/// Ollama backend configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OllamaConfig {
    pub base_url: String,
    pub gen_model: String,
    pub embed_model: String,
    pub dimension: usize,
    /// Categories the classifier must choose from.
    pub categories: Vec<String>,
    pub gen_timeout: Duration,
    pub embed_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            gen_model: DEFAULT_GEN_MODEL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
            dimension: DEFAULT_DIMENSION,
            categories: defaults::CATEGORIES.iter().map(|c| c.to_string()).collect(),
            gen_timeout: Duration::from_secs(defaults::GEN_TIMEOUT_SECS),
            embed_timeout: Duration::from_secs(defaults::EMBED_TIMEOUT_SECS),
        }
    }
}

impl OllamaConfig {
    /// Load from `OLLAMA_URL`, `OLLAMA_GEN_MODEL`, `OLLAMA_EMBED_MODEL`,
    /// `OLLAMA_EMBED_DIM` and `OLLAMA_CATEGORIES` (comma-separated).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("OLLAMA_GEN_MODEL") {
            config.gen_model = model;
        }
        if let Ok(model) = std::env::var("OLLAMA_EMBED_MODEL") {
            config.embed_model = model;
        }
        if let Some(dim) = std::env::var("OLLAMA_EMBED_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.dimension = dim;
        }
        if let Ok(raw) = std::env::var("OLLAMA_CATEGORIES") {
            let categories = parse_categories(&raw);
            if !categories.is_empty() {
                config.categories = categories;
            }
        }
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }
}

fn parse_categories(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Ollama backend implementing both [`Classifier`] and [`Embedder`].
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.gen_timeout.max(config.embed_timeout))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        info!(
            subsystem = "inference",
            component = "ollama",
            url = %config.base_url,
            gen_model = %config.gen_model,
            embed_model = %config.embed_model,
            categories = config.categories.len(),
            "Initializing Ollama backend"
        );
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(OllamaConfig::from_env())
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Whether the Ollama server answers `/api/tags`.
    pub async fn health_check(&self) -> bool {
        let response = self
            .client
            .get(format!("{}/api/tags", self.config.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "Ollama health check failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "Ollama health check error");
                false
            }
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You classify documents. Choose exactly one category from: {}. \
             Respond with JSON: {{\"category\": \"<category>\", \"confidence\": <0.0-1.0>}}.",
            self.config.categories.join(", ")
        )
    }

    /// Match a model-supplied category against the configured list.
    fn resolve_category(&self, raw: &str) -> Option<String> {
        let wanted = raw.trim().to_ascii_lowercase();
        self.config
            .categories
            .iter()
            .find(|c| c.eq_ignore_ascii_case(&wanted))
            .cloned()
    }
}

/// Map an unsuccessful HTTP status to a stage error.
fn status_error(status: StatusCode, body: &str, category: FailureCategory) -> StageError {
    let message = format!("Ollama returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        StageError::rate_limited(message)
    } else if status.is_server_error() {
        StageError::service_unavailable(message)
    } else {
        StageError::terminal(category, message)
    }
}

fn request_error(e: reqwest::Error) -> StageError {
    StageError::service_unavailable(format!("Request failed: {e}"))
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Request payload for the Ollama `/api/chat` endpoint.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
    /// Suppress chain-of-thought for thinking models.
    think: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

/// JSON object the model is asked to produce.
#[derive(Deserialize)]
struct ClassificationReply {
    category: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl Classifier for OllamaBackend {
    #[instrument(skip(self, content), fields(subsystem = "inference", component = "ollama", op = "classify", model = %self.config.gen_model, text_len = content.text.len()))]
    async fn classify(&self, content: &ExtractedContent) -> StageOutcome<Classification> {
        let start = Instant::now();
        let request = ChatRequest {
            model: &self.config.gen_model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: truncate_chars(&content.text, defaults::CLASSIFY_MAX_CHARS)
                        .to_string(),
                },
            ],
            stream: false,
            format: "json",
            think: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.config.base_url))
            .timeout(self.config.gen_timeout)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, FailureCategory::Classification));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| StageError::malformed_response(format!("Failed to parse response: {e}")))?;
        let reply: ClassificationReply = serde_json::from_str(&chat.message.content)
            .map_err(|e| StageError::malformed_response(format!("Reply is not valid JSON: {e}")))?;
        let category = self.resolve_category(&reply.category).ok_or_else(|| {
            StageError::malformed_response(format!("Unknown category '{}'", reply.category))
        })?;

        let elapsed = logging::millis(start.elapsed());
        debug!(category = %category, duration_ms = elapsed, "Classification complete");
        if elapsed > 30_000 {
            warn!(duration_ms = elapsed, slow = true, "Slow classification");
        }

        Ok(Classification {
            category,
            confidence: reply.confidence,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.gen_model
    }
}

#[async_trait]
impl Embedder for OllamaBackend {
    #[instrument(skip(self, text), fields(subsystem = "inference", component = "ollama", op = "embed", model = %self.config.embed_model, text_len = text.len()))]
    async fn embed(&self, text: &str) -> StageOutcome<Vec<f32>> {
        let start = Instant::now();
        let request = EmbeddingRequest {
            model: &self.config.embed_model,
            input: vec![text],
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.config.base_url))
            .timeout(self.config.embed_timeout)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, FailureCategory::Embedding));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| StageError::malformed_response(format!("Failed to parse response: {e}")))?;
        let vector = result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| StageError::malformed_response("No embedding returned"))?;
        if vector.len() != self.config.dimension {
            return Err(StageError::terminal(
                FailureCategory::Embedding,
                format!(
                    "Embedding dimension {} does not match configured {}",
                    vector.len(),
                    self.config.dimension
                ),
            ));
        }

        let elapsed = logging::millis(start.elapsed());
        debug!(duration_ms = elapsed, "Embedding complete");
        if elapsed > 5_000 {
            warn!(duration_ms = elapsed, slow = true, "Slow embedding operation");
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.embed_model
    }
}
