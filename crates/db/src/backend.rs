//! `TaskBackend` over the `job_queue` table.

use async_trait::async_trait;
use queue::{ClaimedTask, QueueError, QueueMessage, TaskBackend, TaskId, TaskRecord};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::{repository::jobs, DbError, DbPool};

/// Shared by dispatchers, trackers and workers in any number of processes.
#[derive(Clone)]
pub struct PgTaskBackend {
    pool: DbPool,
}

impl PgTaskBackend {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Task ids issued by this backend are UUIDs; anything else cannot exist.
fn parse_id(task_id: &TaskId) -> Result<Uuid, QueueError> {
    Uuid::parse_str(task_id.as_str()).map_err(|_| QueueError::TaskNotFound(task_id.to_string()))
}

fn not_found(task_id: &TaskId) -> impl FnOnce(DbError) -> QueueError + '_ {
    move |err| match err {
        DbError::NotFound => QueueError::TaskNotFound(task_id.to_string()),
        other => other.into(),
    }
}

#[async_trait]
impl TaskBackend for PgTaskBackend {
    async fn publish(&self, message: QueueMessage) -> Result<TaskId, QueueError> {
        let row = jobs::enqueue_job(&self.pool, &message.job_ref, message.args).await?;
        debug!(task_id = %row.id, job_ref = %row.job_ref, "message published");
        Ok(TaskId::from(row.id.to_string()))
    }

    async fn fetch(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let Ok(id) = parse_id(task_id) else {
            return Ok(None);
        };
        match jobs::fetch_job(&self.pool, id).await? {
            Some(row) => Ok(Some(row.into_record()?)),
            None => Ok(None),
        }
    }

    async fn claim(&self) -> Result<Option<ClaimedTask>, QueueError> {
        let Some(row) = jobs::claim_next_job(&self.pool).await? else {
            return Ok(None);
        };
        let message = row.message();
        let record = row.into_record()?;
        Ok(Some(ClaimedTask { task_id: record.task_id, message, attempt: record.attempts }))
    }

    async fn update_progress(&self, task_id: &TaskId, progress: Value) -> Result<(), QueueError> {
        jobs::update_progress(&self.pool, parse_id(task_id)?, progress)
            .await
            .map_err(not_found(task_id))
    }

    async fn complete(&self, task_id: &TaskId, result: Value) -> Result<(), QueueError> {
        jobs::complete_job(&self.pool, parse_id(task_id)?, result)
            .await
            .map_err(not_found(task_id))
    }

    async fn fail(&self, task_id: &TaskId, error: &str) -> Result<(), QueueError> {
        jobs::fail_job(&self.pool, parse_id(task_id)?, error)
            .await
            .map_err(not_found(task_id))
    }
}
