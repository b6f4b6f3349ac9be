//! PostgreSQL-backed work queue.
//!
//! Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never take the same
//! visible row, and a visibility timestamp in place of a broker's
//! invisibility window.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::job::to_chrono;
use super::queue::{Delivery, WorkQueue};
use crate::common::JobId;

pub struct PostgresWorkQueue {
    pool: PgPool,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transcription_queue (job_id, visible_at)
            VALUES ($1, NOW())
            ON CONFLICT (job_id) DO UPDATE
            SET visible_at = LEAST(transcription_queue.visible_at, NOW())
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue job")?;
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let visible_at = chrono::Utc::now() + to_chrono(visibility);
        let row: Option<(Uuid, Uuid, i32)> = sqlx::query_as(
            r#"
            WITH next_item AS (
                SELECT job_id
                FROM transcription_queue
                WHERE visible_at <= NOW()
                ORDER BY visible_at ASC, enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE transcription_queue q
            SET visible_at = $1,
                receipt = gen_random_uuid(),
                leased_by = $2,
                delivery_count = q.delivery_count + 1
            FROM next_item
            WHERE q.job_id = next_item.job_id
            RETURNING q.job_id, q.receipt, q.delivery_count
            "#,
        )
        .bind(visible_at)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to dequeue job")?;

        Ok(row.map(|(job_id, receipt, delivery_count)| Delivery {
            job_id: JobId::from_uuid(job_id),
            receipt,
            delivery_count: delivery_count.max(0) as u32,
        }))
    }

    async fn extend(&self, receipt: Uuid, visibility: Duration) -> Result<bool> {
        let visible_at = chrono::Utc::now() + to_chrono(visibility);
        let result = sqlx::query("UPDATE transcription_queue SET visible_at = $2 WHERE receipt = $1")
            .bind(receipt)
            .bind(visible_at)
            .execute(&self.pool)
            .await
            .context("Failed to extend visibility")?;
        Ok(result.rows_affected() > 0)
    }

    async fn ack(&self, receipt: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM transcription_queue WHERE receipt = $1")
            .bind(receipt)
            .execute(&self.pool)
            .await
            .context("Failed to ack delivery")?;
        Ok(())
    }

    async fn release(&self, receipt: Uuid, delay: Duration) -> Result<()> {
        let visible_at = chrono::Utc::now() + to_chrono(delay);
        sqlx::query(
            r#"
            UPDATE transcription_queue
            SET visible_at = $2,
                receipt = NULL,
                leased_by = NULL
            WHERE receipt = $1
            "#,
        )
        .bind(receipt)
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .context("Failed to release delivery")?;
        Ok(())
    }

    async fn pending(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transcription_queue")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count queue")?;
        Ok(count.max(0) as usize)
    }
}
