//! Centralized default constants for docflow.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by domain area.

// =============================================================================
// SCHEDULING
// =============================================================================

/// Default number of pool workers (0 = one per CPU core, resolved at runtime).
pub const POOL_WORKERS: usize = 0;

/// Jobs a pool worker pulls from the shared queue per dispatch.
pub const POOL_CHUNK_SIZE: usize = 4;

/// Maximum jobs in flight for the cooperative scheduler.
pub const ASYNC_MAX_CONCURRENT: usize = 8;

/// Maximum jobs of one distributed batch leased by workers at once.
pub const DISTRIBUTED_MAX_IN_FLIGHT: usize = 64;

/// Polling interval (ms) used for distributed progress and status polling.
pub const POLL_INTERVAL_MS: u64 = 500;

// =============================================================================
// RETRY
// =============================================================================

/// Maximum attempts per job (first run included).
pub const MAX_ATTEMPTS: i32 = 3;

/// Base delay for exponential backoff (`base * 2^attempt`).
pub const RETRY_BASE_MS: u64 = 500;

/// Cap on a single backoff delay.
pub const RETRY_MAX_MS: u64 = 30_000;

// =============================================================================
// STAGES
// =============================================================================

/// Default per-stage timeout in seconds.
pub const STAGE_TIMEOUT_SECS: u64 = 120;

/// Minimum interval between requests to the classification/embedding
/// service (0 = unlimited).
pub const AI_MIN_INTERVAL_MS: u64 = 0;

/// Files larger than this get a weak (path+size+mtime) fingerprint instead
/// of a content hash.
pub const STRONG_HASH_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Maximum bytes the text extractor will read from a single file.
pub const TEXT_EXTRACTION_MAX_BYTES: u64 = 10 * 1024 * 1024;

// =============================================================================
// PROGRESS
// =============================================================================

/// Rolling window used for throughput/ETA estimation.
pub const THROUGHPUT_WINDOW_SECS: u64 = 60;

/// Maximum completion samples retained per batch.
pub const THROUGHPUT_MAX_SAMPLES: usize = 512;

/// How long a finished or cancelled batch stays in the in-process registry.
pub const BATCH_RETENTION_SECS: u64 = 3_600;

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 1024;

// =============================================================================
// DISTRIBUTED WORKER
// =============================================================================

/// Lease (visibility timeout) for a dequeued task, in seconds.
pub const JOB_LEASE_SECS: u64 = 600;

/// Worker polling interval when the queue is empty (ms).
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Maximum concurrent jobs per worker process.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Current version of the queue payload contract.
pub const TASK_PAYLOAD_VERSION: u32 = 1;

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Ollama base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default classification model name (Ollama).
pub const GEN_MODEL: &str = "llama3.2:3b";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Default document categories offered to the classifier.
pub const CATEGORIES: &[&str] = &[
    "invoice",
    "contract",
    "report",
    "correspondence",
    "technical",
    "other",
];

/// Timeout for classification requests in seconds.
pub const GEN_TIMEOUT_SECS: u64 = 120;

/// Timeout for embedding requests in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Characters of document text sent to the classifier.
pub const CLASSIFY_MAX_CHARS: usize = 4_000;
