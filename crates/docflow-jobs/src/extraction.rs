//! Extract stage collaborators: a UTF-8 text extractor and an
//! extension-keyed registry for dispatching to format-specific extractors.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use docflow_core::{
    defaults, ExtractedContent, Extractor, FailureCategory, Job, StageError, StageOutcome,
};

/// Extensions read as plain text.
pub const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "csv", "json", "log", "html", "xml", "yaml", "toml", "rst",
];

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "md" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" => "text/html",
        "xml" => "application/xml",
        "yaml" => "application/yaml",
        "toml" => "application/toml",
        "rst" => "text/x-rst",
        _ => "text/plain",
    }
}

/// Reads local text files, decoding invalid UTF-8 lossily.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    max_bytes: u64,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self::new(defaults::TEXT_EXTRACTION_MAX_BYTES)
    }
}

impl TextExtractor {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    fn io_error(path: &Path, e: io::Error) -> StageError {
        let message = format!("{}: {}", path.display(), e);
        match e.kind() {
            io::ErrorKind::NotFound => StageError::terminal(FailureCategory::Extraction, message),
            _ => StageError::retryable(FailureCategory::Extraction, message),
        }
    }
}

#[async_trait]
impl Extractor for TextExtractor {
    async fn extract(&self, job: &Job) -> StageOutcome<ExtractedContent> {
        let path = job.source_ref.as_path().ok_or_else(|| {
            StageError::unsupported_format(format!(
                "text extractor cannot read blob source {}",
                job.source_ref
            ))
        })?;

        let ext = job.source_ref.extension().unwrap_or_default();
        if !TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Err(StageError::unsupported_format(format!(
                "unsupported file type '{}': {}",
                ext,
                path.display()
            )));
        }

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Self::io_error(path, e))?;
        if !meta.is_file() {
            return Err(StageError::terminal(
                FailureCategory::Extraction,
                format!("not a regular file: {}", path.display()),
            ));
        }
        if meta.len() > self.max_bytes {
            return Err(StageError::terminal(
                FailureCategory::Extraction,
                format!(
                    "{} is {} bytes, limit is {}",
                    path.display(),
                    meta.len(),
                    self.max_bytes
                ),
            ));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Self::io_error(path, e))?;
        let source_bytes = bytes.len() as u64;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        Ok(ExtractedContent {
            text,
            content_type: content_type_for(&ext).to_string(),
            source_bytes,
        })
    }

    fn name(&self) -> &str {
        "text"
    }
}

/// Dispatches extraction by file extension.
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Registry with [`TextExtractor`] for every text extension.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_all(TEXT_EXTENSIONS, Arc::new(TextExtractor::default()));
        registry
    }

    /// Register an extractor for one extension. Replaces any existing one.
    pub fn register(&mut self, extension: &str, extractor: Arc<dyn Extractor>) {
        self.extractors
            .insert(extension.trim_start_matches('.').to_ascii_lowercase(), extractor);
    }

    pub fn register_all(&mut self, extensions: &[&str], extractor: Arc<dyn Extractor>) {
        for ext in extensions {
            self.register(ext, extractor.clone());
        }
    }

    pub fn has_extractor(&self, extension: &str) -> bool {
        self.extractors
            .contains_key(&extension.trim_start_matches('.').to_ascii_lowercase())
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.extractors.keys().cloned().collect();
        exts.sort();
        exts
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl Extractor for ExtractorRegistry {
    async fn extract(&self, job: &Job) -> StageOutcome<ExtractedContent> {
        let ext = job.source_ref.extension().unwrap_or_default();
        let extractor = self.extractors.get(&ext).ok_or_else(|| {
            StageError::unsupported_format(format!(
                "no extractor registered for '{}' ({})",
                ext, job.source_ref
            ))
        })?;
        extractor.extract(job).await
    }

    fn name(&self) -> &str {
        "registry"
    }
}
