//! Structured logging schema and field name constants for docflow.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue: retry scheduled, embedding fallback applied |
//! | INFO  | Lifecycle events (scheduler start/stop, batch submitted/completed) |
//! | DEBUG | Decision points: dedup skips, dispatch, cancellation checks |
//! | TRACE | Per-stage iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "engine", "scheduler", "pipeline", "db", "inference", "worker"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "cooperative", "distributed", "registry", "ollama"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "submit", "dequeue", "classify", "embed"
pub const OPERATION: &str = "op";

/// External grouping key shared by related batches.
pub const CORRELATION_ID: &str = "correlation_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Batch UUID the job belongs to.
pub const BATCH_ID: &str = "batch_id";

/// Pipeline stage name.
pub const STAGE: &str = "stage";

/// Attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

/// Pool worker or remote worker identifier.
pub const WORKER_ID: &str = "worker_id";

/// Scheduling strategy ("pool", "async", "distributed").
pub const STRATEGY: &str = "strategy";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of jobs in a batch or dispatch.
pub const JOB_COUNT: &str = "job_count";

/// Delay before the next attempt in milliseconds.
pub const DELAY_MS: &str = "delay_ms";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Slow operation threshold exceeded.
pub const SLOW: &str = "slow";

/// `d` in whole milliseconds for a [`DURATION_MS`] or [`DELAY_MS`] field.
/// Saturates instead of truncating.
pub fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
