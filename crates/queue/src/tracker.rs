//! Observes dispatched tasks.
//!
//! Two entry points share one status call: `poll` for graph-driven polling
//! loops (one non-blocking check per visit) and `wait` for callers that can
//! afford to block for a bounded time.  A wait that runs out returns the last
//! record with state `TimedOut` rather than an error.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{instrument, trace, warn};

use crate::{QueueError, TaskBackend, TaskId, TaskRecord, TrackerConfig};

/// Longest single `wait`; larger timeouts are clamped to it.
const MAX_WAIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone)]
pub struct Tracker {
    backend: Arc<dyn TaskBackend>,
    config: TrackerConfig,
}

impl Tracker {
    pub fn new(backend: Arc<dyn TaskBackend>, config: TrackerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Current record.  Unknown ids are `QueueError::TaskNotFound`.
    pub async fn status(&self, task_id: &TaskId) -> Result<TaskRecord, QueueError> {
        self.backend
            .fetch(task_id)
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))
    }

    /// Single non-blocking check.  Once a task is terminal, repeated polls
    /// return the same record and change nothing.
    pub async fn poll(&self, task_id: &TaskId) -> Result<TaskRecord, QueueError> {
        let record = self.status(task_id).await?;
        trace!(task_id = %task_id, state = %record.state, "polled task");
        Ok(record)
    }

    /// Block until the task is terminal or `timeout` elapses.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn wait(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<TaskRecord, QueueError> {
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        loop {
            let record = self.status(task_id).await?;
            if record.state.is_terminal() {
                return Ok(record);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(state = %record.state, ?timeout, "wait for task timed out");
                return Ok(record.into_timed_out());
            }
            sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    /// `wait` bounded by the configured default timeout.
    pub async fn wait_default(&self, task_id: &TaskId) -> Result<TaskRecord, QueueError> {
        self.wait(task_id, self.config.default_wait_timeout()).await
    }

    /// Worker-side update path for long-running jobs.
    pub async fn report_progress(
        &self,
        task_id: &TaskId,
        progress: Value,
    ) -> Result<(), QueueError> {
        self.backend.update_progress(task_id, progress).await
    }
}
