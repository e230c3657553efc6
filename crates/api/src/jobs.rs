//! Job functions registered with queue workers.

use std::sync::Arc;

use async_trait::async_trait;
use queue::{JobContext, JobError, JobFunction, JobRegistry};
use serde_json::{json, Value};
use tracing::instrument;

use crate::resources::Answering;

/// `jobRef` of the remote execution step.
pub const EXECUTE_JOB: &str = "execute";

/// Answers the question carried in the job's configuration record.
pub struct ExecuteJob {
    answering: Answering,
}

impl ExecuteJob {
    pub fn new(answering: Answering) -> Self {
        Self { answering }
    }
}

#[async_trait]
impl JobFunction for ExecuteJob {
    #[instrument(skip_all, fields(task_id = %ctx.task_id, job_id = %ctx.job_id))]
    async fn run(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let config = ctx.config().await?;
        ctx.report_progress(json!({ "stage": "answering", "attempt": ctx.attempt })).await?;

        self.answering.answer(&config).await.map_err(|e| JobError::Failed(e.to_string()))
    }
}

/// Every job function this service knows how to run.
pub fn registry(answering: Answering) -> JobRegistry {
    JobRegistry::new().with(EXECUTE_JOB, Arc::new(ExecuteJob::new(answering)))
}
