//! Queue + result store contract, and an in-memory implementation.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::{QueueError, QueueMessage, TaskId, TaskRecord, TaskState};

/// A message handed to a worker by [`TaskBackend::claim`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task_id: TaskId,
    pub message: QueueMessage,
    /// Claim count including this one.
    pub attempt: u32,
}

/// Durable queue plus task-record store.
///
/// Every state change must go through [`TaskState::can_transition_to`]; a
/// backend rejects transitions out of a terminal state.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Enqueue a message and create its `Queued` record.
    async fn publish(&self, message: QueueMessage) -> Result<TaskId, QueueError>;

    /// Current record, or `None` for an unknown id.
    async fn fetch(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, QueueError>;

    /// Atomically take the oldest queued message and mark it `Running`.
    async fn claim(&self) -> Result<Option<ClaimedTask>, QueueError>;

    async fn update_progress(&self, task_id: &TaskId, progress: Value) -> Result<(), QueueError>;

    async fn complete(&self, task_id: &TaskId, result: Value) -> Result<(), QueueError>;

    async fn fail(&self, task_id: &TaskId, error: &str) -> Result<(), QueueError>;
}

/// Process-local backend.  Dispatcher and worker must share the same
/// instance (e.g. through an `Arc`).
#[derive(Default)]
pub struct InMemoryTaskBackend {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
    pending: Mutex<VecDeque<(TaskId, QueueMessage)>>,
}

impl InMemoryTaskBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting to be claimed.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn modify<F>(&self, task_id: &TaskId, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut TaskRecord) -> Result<(), QueueError> + Send,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(task_id)
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
        f(record)
    }
}

#[async_trait]
impl TaskBackend for InMemoryTaskBackend {
    async fn publish(&self, message: QueueMessage) -> Result<TaskId, QueueError> {
        let task_id = TaskId::generate();
        let record = TaskRecord::queued(task_id.clone(), message.job_ref.clone());

        self.records.write().await.insert(task_id.clone(), record);
        self.pending.lock().await.push_back((task_id.clone(), message));
        debug!(task_id = %task_id, "message published");
        Ok(task_id)
    }

    async fn fetch(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.records.read().await.get(task_id).cloned())
    }

    async fn claim(&self) -> Result<Option<ClaimedTask>, QueueError> {
        let Some((task_id, message)) = self.pending.lock().await.pop_front() else {
            return Ok(None);
        };

        let mut attempt = 0;
        self.modify(&task_id, |record| {
            record.transition(TaskState::Running)?;
            record.attempts += 1;
            attempt = record.attempts;
            Ok(())
        })
        .await?;

        Ok(Some(ClaimedTask { task_id, message, attempt }))
    }

    async fn update_progress(&self, task_id: &TaskId, progress: Value) -> Result<(), QueueError> {
        self.modify(task_id, |record| {
            record.transition(TaskState::Running)?;
            record.progress = progress;
            Ok(())
        })
        .await
    }

    async fn complete(&self, task_id: &TaskId, result: Value) -> Result<(), QueueError> {
        self.modify(task_id, |record| {
            record.transition(TaskState::Succeeded)?;
            record.result = Some(result);
            Ok(())
        })
        .await
    }

    async fn fail(&self, task_id: &TaskId, error: &str) -> Result<(), QueueError> {
        self.modify(task_id, |record| {
            record.transition(TaskState::Failed)?;
            record.error = Some(error.to_owned());
            Ok(())
        })
        .await
    }
}
