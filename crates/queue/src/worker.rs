//! Worker side of the queue.
//!
//! A [`Worker`] claims messages from a [`TaskBackend`], looks the message's
//! `jobRef` up in a [`JobRegistry`] and runs the matching [`JobFunction`].
//! Every claimed task ends in exactly one of `complete` or `fail`; a job that
//! panics is recorded as failed, it does not take the worker loop down.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    ClaimedTask, ConfigBroker, JobConfig, QueueError, TaskBackend, TaskId, Tracker, WorkerConfig,
};

#[derive(Debug, Error)]
pub enum JobError {
    /// No config record exists for the job id.
    #[error("no configuration found for job '{0}'")]
    MissingConfig(String),

    #[error("invalid configuration for job '{job_id}': {message}")]
    InvalidConfig { job_id: String, message: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Everything a job function may touch while it runs.
pub struct JobContext {
    pub task_id: TaskId,
    /// Key of the job's config record.  Falls back to the task id when the
    /// message carries no `jobId`.
    pub job_id: String,
    pub args: Value,
    pub attempt: u32,
    broker: Arc<dyn ConfigBroker>,
    tracker: Tracker,
}

impl JobContext {
    /// Raw config payload.  A missing record is an error, never an empty
    /// default.
    pub async fn raw_config(&self) -> Result<Value, JobError> {
        self.broker
            .get(&self.job_id)
            .await?
            .map(|record| record.payload)
            .ok_or_else(|| JobError::MissingConfig(self.job_id.clone()))
    }

    /// Typed config.  Fails fast on missing records or missing fields.
    pub async fn config(&self) -> Result<JobConfig, JobError> {
        let payload = self.raw_config().await?;
        JobConfig::from_payload(&payload).map_err(|e| JobError::InvalidConfig {
            job_id: self.job_id.clone(),
            message: match e {
                QueueError::InvalidConfig(msg) => msg,
                other => other.to_string(),
            },
        })
    }

    pub async fn report_progress(&self, progress: Value) -> Result<(), JobError> {
        Ok(self.tracker.report_progress(&self.task_id, progress).await?)
    }
}

/// A unit of work that runs on a worker.
#[async_trait]
pub trait JobFunction: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<Value, JobError>;
}

/// `jobRef` name to job function.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn JobFunction>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_ref: impl Into<String>, job: Arc<dyn JobFunction>) {
        self.jobs.insert(job_ref.into(), job);
    }

    /// Builder-style `register`.
    pub fn with(mut self, job_ref: impl Into<String>, job: Arc<dyn JobFunction>) -> Self {
        self.register(job_ref, job);
        self
    }

    pub fn get(&self, job_ref: &str) -> Option<Arc<dyn JobFunction>> {
        self.jobs.get(job_ref).cloned()
    }

    pub fn job_refs(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone)]
pub struct Worker {
    backend: Arc<dyn TaskBackend>,
    broker: Arc<dyn ConfigBroker>,
    tracker: Tracker,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    counters: Arc<Counters>,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        broker: Arc<dyn ConfigBroker>,
        tracker: Tracker,
        registry: JobRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            backend,
            broker,
            tracker,
            registry: Arc::new(registry),
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Claim and run one task.  Returns `false` when the queue was empty.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(claimed) = self.backend.claim().await? else {
            return Ok(false);
        };
        self.execute(claimed).await?;
        Ok(true)
    }

    /// Run `concurrency` claim loops until `shutdown` is cancelled.  Tasks in
    /// flight finish before the loops exit.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            concurrency = self.config.concurrency,
            jobs = ?self.registry.job_refs().collect::<Vec<_>>(),
            "worker started"
        );

        let loops = (0..self.config.concurrency.max(1)).map(|slot| {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            async move { worker.claim_loop(slot, shutdown).await }
        });
        futures::future::join_all(loops).await;

        info!(stats = ?self.stats(), "worker stopped");
    }

    async fn claim_loop(&self, slot: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(slot, error = %e, "claim loop error"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.idle_interval()) => {}
            }
        }
        debug!(slot, "claim loop exited");
    }

    #[instrument(
        skip(self, claimed),
        fields(task_id = %claimed.task_id, job_ref = %claimed.message.job_ref)
    )]
    async fn execute(&self, claimed: ClaimedTask) -> Result<(), QueueError> {
        let ClaimedTask { task_id, message, attempt } = claimed;

        let Some(job) = self.registry.get(&message.job_ref) else {
            warn!("no job registered for this reference");
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return self
                .backend
                .fail(&task_id, &format!("unknown job reference '{}'", message.job_ref))
                .await;
        };

        let ctx = JobContext {
            job_id: message.job_id().map(str::to_owned).unwrap_or_else(|| task_id.to_string()),
            task_id: task_id.clone(),
            args: message.args,
            attempt,
            broker: Arc::clone(&self.broker),
            tracker: self.tracker.clone(),
        };

        let outcome = AssertUnwindSafe(job.run(&ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(result)) => self.record_success(&task_id, result, attempt).await?,
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "job failed");
                self.backend.fail(&task_id, &e.to_string()).await?;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(attempt, panic = %message, "job panicked");
                self.backend.fail(&task_id, &format!("job panicked: {message}")).await?;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Store a job's result.  A backend that keeps refusing the result gets
    /// the task failed instead, so it never stays `Running`.
    async fn record_success(
        &self,
        task_id: &TaskId,
        result: Value,
        attempt: u32,
    ) -> Result<(), QueueError> {
        let mut tries = 0;
        let last_error = loop {
            tries += 1;
            match self.backend.complete(task_id, result.clone()).await {
                Ok(()) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    info!(attempt, "job succeeded");
                    return Ok(());
                }
                Err(e) if tries < COMPLETE_ATTEMPTS => {
                    warn!(attempt, tries, error = %e, "storing job result failed, retrying");
                    sleep(self.config.idle_interval() * tries).await;
                }
                Err(e) => break e,
            }
        };

        error!(attempt, error = %last_error, "job result could not be stored");
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.backend
            .fail(task_id, &format!("job result could not be stored: {last_error}"))
            .await
    }
}

/// Attempts at storing a successful result before the task is failed.
const COMPLETE_ATTEMPTS: u32 = 3;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
