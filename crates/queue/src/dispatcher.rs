//! Publishes job references to the queue.
//!
//! `submit` enqueues work that will eventually run with real external
//! effects.  It performs no deduplication: callers must not submit the same
//! logical request twice unless they carry their own idempotency key.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::{ConfigBroker, DispatchConfig, QueueError, QueueMessage, TaskBackend, TaskId};

#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn TaskBackend>,
    broker: Arc<dyn ConfigBroker>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        broker: Arc<dyn ConfigBroker>,
        config: DispatchConfig,
    ) -> Self {
        Self { backend, broker, config }
    }

    /// Publish `{job_ref, args}` and return without waiting for the job.
    #[instrument(skip(self, args))]
    pub async fn submit(&self, job_ref: &str, args: Value) -> Result<TaskId, QueueError> {
        let size = serde_json::to_vec(&args)?.len();
        if size > self.config.max_args_bytes {
            return Err(QueueError::ArgsTooLarge { size, limit: self.config.max_args_bytes });
        }

        let task_id = self.backend.publish(QueueMessage::new(job_ref, args)).await?;
        info!(task_id = %task_id, "job submitted");
        Ok(task_id)
    }

    /// Write the job's configuration to the broker, then publish a message
    /// that references it by `job_id`.  The broker write completes before
    /// the message becomes visible to any worker.
    #[instrument(skip(self, payload))]
    pub async fn submit_with_config(
        &self,
        job_id: &str,
        job_ref: &str,
        payload: Value,
    ) -> Result<TaskId, QueueError> {
        self.broker.put(job_id, payload).await?;
        self.submit(job_ref, json!({ "jobId": job_id })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryConfigBroker, InMemoryTaskBackend, TaskState};

    fn setup(limit: usize) -> (Dispatcher, Arc<InMemoryTaskBackend>, Arc<InMemoryConfigBroker>) {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let broker = Arc::new(InMemoryConfigBroker::new());
        let dispatcher = Dispatcher::new(
            backend.clone(),
            broker.clone(),
            DispatchConfig { max_args_bytes: limit },
        );
        (dispatcher, backend, broker)
    }

    #[tokio::test]
    async fn submit_returns_without_running_the_job() {
        let (dispatcher, backend, _) = setup(1024);
        let id = dispatcher.submit("execute", json!({ "n": 1 })).await.unwrap();

        let record = backend.fetch(&id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn config_is_written_before_publish() {
        let (dispatcher, backend, broker) = setup(1024);
        let id = dispatcher
            .submit_with_config("r1", "execute", json!({ "tenant": "acme" }))
            .await
            .unwrap();

        assert!(broker.get("r1").await.unwrap().is_some());
        let claimed = backend.claim().await.unwrap().unwrap();
        assert_eq!(claimed.task_id, id);
        assert_eq!(claimed.message.job_id(), Some("r1"));
    }

    #[tokio::test]
    async fn oversized_args_are_rejected() {
        let (dispatcher, backend, _) = setup(16);
        let err = dispatcher
            .submit("execute", json!({ "blob": "x".repeat(64) }))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::ArgsTooLarge { limit: 16, .. }));
        assert_eq!(backend.pending_len().await, 0);
    }
}
