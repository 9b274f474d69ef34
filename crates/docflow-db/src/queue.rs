//! Durable task queue on PostgreSQL.
//!
//! Messages become invisible for a lease when dequeued (`visible_at` is pushed
//! forward). A worker that dies without acking simply lets the lease run out
//! and the message is handed to the next worker, giving at-least-once
//! delivery without any broker-specific API.
//!
//! Batch messages carry a lease limit. Two workers claiming at the same
//! instant may each see the batch one under its limit, so the bound can be
//! exceeded by the number of concurrent claimers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use docflow_core::{new_v7, Delivery, Error, Result, TaskPayload, TaskQueue};

/// PostgreSQL implementation of TaskQueue.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: Pool<Postgres>,
}

impl PgTaskQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Messages currently in the queue, leased or not.
    pub async fn depth(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM docflow_task_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

fn chrono_duration(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::InvalidInput(format!("duration: {e}")))
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1 FROM docflow_task_queue LIMIT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn enqueue(&self, payload: &TaskPayload) -> Result<Uuid> {
        let id = new_v7();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO docflow_task_queue (id, job_id, batch_id, payload, delivery_count,
                 visible_at, enqueued_at)
             VALUES ($1, $2, $3, $4, 0, $5, $5)",
        )
        .bind(id)
        .bind(payload.job_id)
        .bind(payload.batch_id)
        .bind(serde_json::to_value(payload)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn enqueue_batch(
        &self,
        payloads: &[TaskPayload],
        max_in_flight: usize,
    ) -> Result<Vec<Uuid>> {
        let limit = i32::try_from(max_in_flight.max(1)).unwrap_or(i32::MAX);
        let now = Utc::now();
        let mut ids = Vec::with_capacity(payloads.len());

        let mut tx = self.pool.begin().await?;
        for payload in payloads {
            let id = new_v7();
            sqlx::query(
                "INSERT INTO docflow_task_queue (id, job_id, batch_id, payload, delivery_count,
                     visible_at, enqueued_at, batch_limit)
                 VALUES ($1, $2, $3, $4, 0, $5, $5, $6)",
            )
            .bind(id)
            .bind(payload.job_id)
            .bind(payload.batch_id)
            .bind(serde_json::to_value(payload)?)
            .bind(now)
            .bind(limit)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let lease_until = now + chrono_duration(lease)?;

        // SKIP LOCKED lets many workers poll the same table without blocking
        // on each other's in-progress claims.
        let row = sqlx::query(
            "UPDATE docflow_task_queue
             SET visible_at = $2, leased_until = $2, delivery_count = delivery_count + 1
             WHERE id = (
                 SELECT q.id FROM docflow_task_queue q
                 WHERE q.visible_at <= $1
                   AND (q.batch_limit IS NULL OR q.batch_limit > (
                       SELECT COUNT(*) FROM docflow_task_queue l
                       WHERE l.batch_id = q.batch_id AND l.leased_until > $1
                   ))
                 ORDER BY q.enqueued_at ASC
                 LIMIT 1
                 FOR UPDATE OF q SKIP LOCKED
             )
             RETURNING id, payload, delivery_count",
        )
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: JsonValue = row.try_get("payload")?;
        Ok(Some(Delivery {
            delivery_id: row.try_get("id")?,
            payload: serde_json::from_value(payload)?,
            delivery_count: row.try_get("delivery_count")?,
        }))
    }

    async fn purge_batch(&self, batch_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM docflow_task_queue
             WHERE batch_id = $1 AND (leased_until IS NULL OR leased_until <= $2)",
        )
        .bind(batch_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ack(&self, delivery_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM docflow_task_queue WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_id: Uuid, delay: Duration) -> Result<()> {
        let visible_at = Utc::now() + chrono_duration(delay)?;
        sqlx::query("UPDATE docflow_task_queue SET visible_at = $2, leased_until = NULL WHERE id = $1")
            .bind(delivery_id)
            .bind(visible_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
