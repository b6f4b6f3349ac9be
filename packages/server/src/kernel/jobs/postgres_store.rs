//! PostgreSQL-backed job store.
//!
//! Structured payloads (input, result, error, checkpoints) live in JSONB
//! columns; everything the reaper and claim logic filter on is a plain column.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::job::{
    Claim, JobError, JobInput, JobState, StageArtifacts, TranscriptResult, TranscriptionJob,
};
use super::store::{JobStore, Mutator, StoreError};
use crate::common::JobId;

const SELECT_COLUMNS: &str = r#"
    id, input, state, progress_label, result, error, artifacts,
    claimed_by, claim_token, claimed_at, lease_expires_at,
    started_at, created_at, updated_at, expires_at
"#;

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    input: Json<JobInput>,
    state: JobState,
    progress_label: Option<String>,
    result: Option<Json<TranscriptResult>>,
    error: Option<Json<JobError>>,
    artifacts: Json<StageArtifacts>,
    claimed_by: Option<String>,
    claim_token: Option<Uuid>,
    claimed_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<JobRow> for TranscriptionJob {
    fn from(row: JobRow) -> Self {
        let claim = match (row.claimed_by, row.claim_token, row.claimed_at, row.lease_expires_at) {
            (Some(worker_id), Some(token), Some(claimed_at), Some(lease_expires_at)) => Some(Claim {
                worker_id,
                token,
                claimed_at,
                lease_expires_at,
            }),
            _ => None,
        };

        TranscriptionJob {
            id: JobId::from_uuid(row.id),
            input: row.input.0,
            state: row.state,
            progress_label: row.progress_label,
            result: row.result.map(|r| r.0),
            error: row.error.map(|e| e.0),
            artifacts: row.artifacts.0,
            claim,
            started_at: row.started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
        }
    }
}

pub struct PostgresJobStore {
    pool: PgPool,
    retention: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn put(&self, job: TranscriptionJob) -> Result<(), StoreError> {
        let claim = job.claim.as_ref();
        let result = sqlx::query(
            r#"
            INSERT INTO transcription_jobs (
                id, input, state, progress_label, result, error, artifacts,
                claimed_by, claim_token, claimed_at, lease_expires_at,
                started_at, created_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(Json(&job.input))
        .bind(job.state)
        .bind(&job.progress_label)
        .bind(job.result.as_ref().map(Json))
        .bind(job.error.as_ref().map(Json))
        .bind(Json(&job.artifacts))
        .bind(claim.map(|c| c.worker_id.clone()))
        .bind(claim.map(|c| c.token))
        .bind(claim.map(|c| c.claimed_at))
        .bind(claim.map(|c| c.lease_expires_at))
        .bind(job.started_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<TranscriptionJob, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM transcription_jobs WHERE id = $1 AND expires_at > NOW()"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into).ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, id: JobId, mutate: Mutator<'_>) -> Result<TranscriptionJob, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM transcription_jobs WHERE id = $1 AND expires_at > NOW() FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        let original: TranscriptionJob = row.into();
        let mut job = original.clone();
        let was_terminal = job.is_terminal();
        // Dropping the transaction on error rolls back and releases the lock.
        mutate(&mut job)?;
        job.restore_immutable(&original);
        job.touch(was_terminal, Utc::now(), self.retention);

        let claim = job.claim.as_ref();
        sqlx::query(
            r#"
            UPDATE transcription_jobs
            SET state = $2,
                progress_label = $3,
                result = $4,
                error = $5,
                artifacts = $6,
                claimed_by = $7,
                claim_token = $8,
                claimed_at = $9,
                lease_expires_at = $10,
                started_at = $11,
                updated_at = $12,
                expires_at = $13
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.state)
        .bind(&job.progress_label)
        .bind(job.result.as_ref().map(Json))
        .bind(job.error.as_ref().map(Json))
        .bind(Json(&job.artifacts))
        .bind(claim.map(|c| c.worker_id.clone()))
        .bind(claim.map(|c| c.token))
        .bind(claim.map(|c| c.claimed_at))
        .bind(claim.map(|c| c.lease_expires_at))
        .bind(job.started_at)
        .bind(job.updated_at)
        .bind(job.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn list_unfinished(&self, limit: usize) -> Result<Vec<TranscriptionJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM transcription_jobs
            WHERE state NOT IN ('completed', 'failed')
              AND expires_at > NOW()
            ORDER BY updated_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM transcription_jobs WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
