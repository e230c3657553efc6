//! `job_configs` repository functions.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use crate::{models::ConfigRow, DbError};

/// Insert or replace the configuration for `job_id`.
pub async fn put_config(pool: &PgPool, job_id: &str, payload: Value) -> Result<ConfigRow, DbError> {
    let row = sqlx::query_as::<_, ConfigRow>(
        r#"
        INSERT INTO job_configs (job_id, payload, written_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (job_id) DO UPDATE
        SET payload = EXCLUDED.payload, written_at = EXCLUDED.written_at
        RETURNING job_id, payload, written_at
        "#,
    )
    .bind(job_id)
    .bind(payload)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_config(pool: &PgPool, job_id: &str) -> Result<Option<ConfigRow>, DbError> {
    let row = sqlx::query_as::<_, ConfigRow>(
        "SELECT job_id, payload, written_at FROM job_configs WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
