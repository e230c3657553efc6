//! Job queue repository functions.
//!
//! The queue is backed by the `job_queue` Postgres table.  Workers claim rows
//! with `SELECT … FOR UPDATE SKIP LOCKED` so concurrent claimers never take
//! the same job.  Every state change loads the row under a lock and checks
//! the transition with `TaskRecord::transition` before writing.

use chrono::Utc;
use queue::TaskState;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{models::JobRow, DbError};

const JOB_COLUMNS: &str =
    "id, job_ref, args, state, progress, result, error, attempts, created_at, updated_at";

/// Insert a new `queued` job.
pub async fn enqueue_job(pool: &PgPool, job_ref: &str, args: Value) -> Result<JobRow, DbError> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        INSERT INTO job_queue (id, job_ref, args, state, progress, attempts, created_at, updated_at)
        VALUES ($1, $2, $3, 'queued', 'null'::jsonb, 0, $4, $4)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(job_ref)
    .bind(args)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn fetch_job(pool: &PgPool, id: Uuid) -> Result<Option<JobRow>, DbError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1");
    let row = sqlx::query_as::<_, JobRow>(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row)
}

/// Atomically take the oldest queued job and mark it `running`.
///
/// Returns `None` if no queued jobs exist.
pub async fn claim_next_job(pool: &PgPool) -> Result<Option<JobRow>, DbError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM job_queue
        WHERE state = 'queued'
        ORDER BY created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#
    ))
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };

    let claimed = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        UPDATE job_queue
        SET state = 'running', attempts = attempts + 1, updated_at = $1
        WHERE id = $2
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(Utc::now())
    .bind(row.id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Some(claimed))
}

/// Record progress on a running job.
pub async fn update_progress(pool: &PgPool, id: Uuid, progress: Value) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    check_transition(&mut tx, id, TaskState::Running).await?;
    sqlx::query("UPDATE job_queue SET progress = $1, updated_at = $2 WHERE id = $3")
        .bind(progress)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Mark a job `succeeded` with its result.
pub async fn complete_job(pool: &PgPool, id: Uuid, result: Value) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    check_transition(&mut tx, id, TaskState::Succeeded).await?;
    sqlx::query(
        "UPDATE job_queue SET state = 'succeeded', result = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(result)
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Mark a job `failed` with an error message.
pub async fn fail_job(pool: &PgPool, id: Uuid, error: &str) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;
    check_transition(&mut tx, id, TaskState::Failed).await?;
    sqlx::query("UPDATE job_queue SET state = 'failed', error = $1, updated_at = $2 WHERE id = $3")
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Lock the row and validate `current -> next`.
async fn check_transition(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    next: TaskState,
) -> Result<(), DbError> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(DbError::NotFound)?;

    let mut record = row.into_record()?;
    record.transition(next)?;
    Ok(())
}
