//! Document store backed by PostgreSQL.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use docflow_core::{DocumentRecord, DocumentStore, FailureCategory, StageError, StageOutcome};

/// Persists document records keyed by job id. A repeated store for the same
/// job (redelivery) overwrites the earlier row.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: Pool<Postgres>,
}

impl PgDocumentStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Stored category for a job, if any.
    pub async fn category_for(&self, job_id: Uuid) -> docflow_core::Result<Option<String>> {
        let category = sqlx::query_scalar("SELECT category FROM docflow_document WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(category)
    }
}

fn storage_error(e: impl std::fmt::Display) -> StageError {
    // Database hiccups are transient from the pipeline's point of view.
    StageError::retryable(FailureCategory::Storage, e.to_string())
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn store(&self, record: &DocumentRecord) -> StageOutcome<()> {
        let source_ref = serde_json::to_value(&record.source_ref)
            .map_err(|e| StageError::terminal(FailureCategory::Storage, e.to_string()))?;

        sqlx::query(
            "INSERT INTO docflow_document (job_id, batch_id, source_ref, content_hash,
                 content_type, body, category, confidence, embedding, embedding_fallback, stored_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (job_id) DO UPDATE SET
                 content_type = EXCLUDED.content_type,
                 body = EXCLUDED.body,
                 category = EXCLUDED.category,
                 confidence = EXCLUDED.confidence,
                 embedding = EXCLUDED.embedding,
                 embedding_fallback = EXCLUDED.embedding_fallback,
                 stored_at = EXCLUDED.stored_at",
        )
        .bind(record.job_id)
        .bind(record.batch_id)
        .bind(source_ref)
        .bind(&record.content_hash)
        .bind(&record.content_type)
        .bind(&record.text)
        .bind(&record.classification.category)
        .bind(record.classification.confidence)
        .bind(record.embedding.as_deref())
        .bind(record.embedding_fallback)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::trace!(
            subsystem = "db",
            component = "documents",
            job_id = %record.job_id,
            "Document stored"
        );
        Ok(())
    }
}
