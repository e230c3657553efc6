//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models.  Conversions into the queue's domain types
//! live next to them and are the only place row strings are parsed.

use chrono::{DateTime, Utc};
use queue::{ConfigRecord, QueueMessage, TaskId, TaskRecord, TaskState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::DbError;

// ---------------------------------------------------------------------------
// job_queue
// ---------------------------------------------------------------------------

/// A job row: the queued message plus its task record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub job_ref: String,
    pub args: Value,
    pub state: String,
    pub progress: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn task_state(&self) -> Result<TaskState, DbError> {
        self.state.parse().map_err(DbError::Corrupt)
    }

    pub fn message(&self) -> QueueMessage {
        QueueMessage::new(self.job_ref.clone(), self.args.clone())
    }

    pub fn into_record(self) -> Result<TaskRecord, DbError> {
        let state = self.task_state()?;
        Ok(TaskRecord {
            task_id: TaskId::from(self.id.to_string()),
            job_ref: self.job_ref,
            state,
            progress: self.progress,
            result: self.result,
            error: self.error,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| DbError::Corrupt(format!("negative attempts on job {}", self.id)))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// job_configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConfigRow {
    pub job_id: String,
    pub payload: Value,
    pub written_at: DateTime<Utc>,
}

impl From<ConfigRow> for ConfigRecord {
    fn from(row: ConfigRow) -> Self {
        ConfigRecord { job_id: row.job_id, payload: row.payload, written_at: row.written_at }
    }
}

// ---------------------------------------------------------------------------
// checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    pub thread_id: String,
    /// Serialised `nodes::State`.
    pub state: Value,
    pub updated_at: DateTime<Utc>,
}
