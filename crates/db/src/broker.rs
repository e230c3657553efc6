//! `ConfigBroker` over the `job_configs` table.

use async_trait::async_trait;
use queue::{ConfigBroker, ConfigRecord, QueueError};
use serde_json::Value;
use tracing::debug;

use crate::{repository::configs, DbError, DbPool};

#[derive(Clone)]
pub struct PgConfigBroker {
    pool: DbPool,
}

impl PgConfigBroker {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn broker_error(err: DbError) -> QueueError {
    QueueError::Broker(err.to_string())
}

#[async_trait]
impl ConfigBroker for PgConfigBroker {
    async fn put(&self, job_id: &str, payload: Value) -> Result<(), QueueError> {
        configs::put_config(&self.pool, job_id, payload).await.map_err(broker_error)?;
        debug!(job_id, "config record written");
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ConfigRecord>, QueueError> {
        let row = configs::get_config(&self.pool, job_id).await.map_err(broker_error)?;
        Ok(row.map(ConfigRecord::from))
    }
}
