//! Job and batch repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use docflow_core::{
    AppliedUpdate, Batch, BatchCounts, BatchStatus, Error, Job, JobRepository, JobStatus,
    JobUpdate, Result,
};

const JOB_COLUMNS: &str = "id, batch_id, source_ref, content_hash, weak_hash, force, params, \
     stage_index, status, attempt_count, last_error, duplicate_of, result, created_at, updated_at";

/// PostgreSQL implementation of JobRepository.
///
/// Updates lock the job row (`SELECT ... FOR UPDATE`) for the duration of the
/// state-machine check, so two processes can never interleave updates to the
/// same job.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: &sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let last_error: Option<JsonValue> = row.try_get("last_error")?;
        let result: Option<JsonValue> = row.try_get("result")?;
        Ok(Job {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            source_ref: serde_json::from_value(row.try_get("source_ref")?)?,
            content_hash: row.try_get("content_hash")?,
            weak_hash: row.try_get("weak_hash")?,
            force: row.try_get("force")?,
            params: serde_json::from_value(row.try_get("params")?)?,
            stage_index: row.try_get("stage_index")?,
            status: status.parse()?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: last_error.map(serde_json::from_value).transpose()?,
            duplicate_of: row.try_get("duplicate_of")?,
            result: result.map(serde_json::from_value).transpose()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO docflow_batch (batch_id, correlation_id, created_at, completed_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(batch.batch_id)
        .bind(&batch.correlation_id)
        .bind(batch.created_at)
        .bind(batch.completed_at)
        .execute(&mut *tx)
        .await?;

        for (seq, job) in jobs.iter().enumerate() {
            sqlx::query(
                "INSERT INTO docflow_job (id, batch_id, seq, source_ref, content_hash, weak_hash,
                     force, params, stage_index, status, attempt_count, last_error, duplicate_of,
                     result, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
            )
            .bind(job.id)
            .bind(job.batch_id)
            .bind(seq as i32)
            .bind(serde_json::to_value(&job.source_ref)?)
            .bind(&job.content_hash)
            .bind(job.weak_hash)
            .bind(job.force)
            .bind(serde_json::to_value(&job.params)?)
            .bind(job.stage_index)
            .bind(job.status.as_str())
            .bind(job.attempt_count)
            .bind(job.last_error.as_ref().map(serde_json::to_value).transpose()?)
            .bind(job.duplicate_of)
            .bind(job.result.as_ref().map(serde_json::to_value).transpose()?)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(
            subsystem = "db",
            component = "jobs",
            op = "create_batch",
            batch_id = %batch.batch_id,
            job_count = jobs.len(),
            "Batch persisted"
        );
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM docflow_job WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<AppliedUpdate> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM docflow_job WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::JobNotFound(job_id))?;

        let mut job = Self::parse_job_row(&row)?;
        let previous = job.apply(update)?;

        sqlx::query(
            "UPDATE docflow_job
             SET stage_index = $2, status = $3, attempt_count = $4, last_error = $5,
                 duplicate_of = $6, result = $7, updated_at = $8
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.stage_index)
        .bind(job.status.as_str())
        .bind(job.attempt_count)
        .bind(job.last_error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(job.duplicate_of)
        .bind(job.result.as_ref().map(serde_json::to_value).transpose()?)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        if job.status.is_terminal() {
            sqlx::query(
                "UPDATE docflow_batch SET completed_at = $2
                 WHERE batch_id = $1
                   AND completed_at IS NULL
                   AND NOT EXISTS (
                       SELECT 1 FROM docflow_job
                       WHERE batch_id = $1
                         AND status NOT IN ('succeeded', 'failed', 'skipped')
                   )",
            )
            .bind(job.batch_id)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(AppliedUpdate { previous, job })
    }

    async fn find_succeeded_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM docflow_job
             WHERE content_hash = $1 AND status = 'succeeded'
             ORDER BY updated_at ASC
             LIMIT 1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_for_batch(&self, batch_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM docflow_job WHERE batch_id = $1 ORDER BY seq"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let Some(row) = sqlx::query(
            "SELECT batch_id, correlation_id, created_at, completed_at
             FROM docflow_batch WHERE batch_id = $1",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let jobs: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, status FROM docflow_job WHERE batch_id = $1 ORDER BY seq")
                .bind(batch_id)
                .fetch_all(&self.pool)
                .await?;

        let mut job_ids = Vec::with_capacity(jobs.len());
        let mut statuses = Vec::with_capacity(jobs.len());
        for (id, status) in jobs {
            job_ids.push(id);
            statuses.push(status.parse::<JobStatus>()?);
        }
        let counts = BatchCounts::from_statuses(statuses);

        Ok(Some(Batch {
            batch_id: row.try_get("batch_id")?,
            correlation_id: row.try_get("correlation_id")?,
            job_ids,
            counts,
            status: if counts.is_complete() {
                BatchStatus::Completed
            } else {
                BatchStatus::Open
            },
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        }))
    }

    async fn processed_since(
        &self,
        batch_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let times = sqlx::query_scalar(
            "SELECT updated_at FROM docflow_job
             WHERE batch_id = $1
               AND status IN ('succeeded', 'failed')
               AND updated_at >= $2
             ORDER BY updated_at",
        )
        .bind(batch_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(times)
    }
}
