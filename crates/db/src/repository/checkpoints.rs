//! `checkpoints` repository functions.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use crate::{models::CheckpointRow, DbError};

pub async fn save_checkpoint(pool: &PgPool, thread_id: &str, state: Value) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO checkpoints (thread_id, state, updated_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (thread_id) DO UPDATE
        SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(thread_id)
    .bind(state)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_checkpoint(
    pool: &PgPool,
    thread_id: &str,
) -> Result<Option<CheckpointRow>, DbError> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "SELECT thread_id, state, updated_at FROM checkpoints WHERE thread_id = $1",
    )
    .bind(thread_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
