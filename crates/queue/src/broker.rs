//! Config broker: the only channel through which a dispatching process hands
//! job parameters to a worker that shares neither memory nor filesystem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::QueueError;

/// Serialised job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub job_id: String,
    pub payload: Value,
    pub written_at: DateTime<Utc>,
}

/// Key/value store holding per-job configuration.
///
/// `put` must be durable before the job is published; `get` must see writes
/// made by any process.  Expiry is left to the implementation.
#[async_trait]
pub trait ConfigBroker: Send + Sync {
    async fn put(&self, job_id: &str, payload: Value) -> Result<(), QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<ConfigRecord>, QueueError>;
}

/// In-process broker for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryConfigBroker {
    records: DashMap<String, ConfigRecord>,
}

impl InMemoryConfigBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ConfigBroker for InMemoryConfigBroker {
    async fn put(&self, job_id: &str, payload: Value) -> Result<(), QueueError> {
        let record = ConfigRecord { job_id: job_id.to_owned(), payload, written_at: Utc::now() };
        self.records.insert(job_id.to_owned(), record);
        debug!(job_id, "config record written");
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ConfigRecord>, QueueError> {
        Ok(self.records.get(job_id).map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get() {
        let broker = InMemoryConfigBroker::new();
        broker.put("r1", json!({ "tenant": "acme" })).await.unwrap();

        let record = broker.get("r1").await.unwrap().expect("written");
        assert_eq!(record.job_id, "r1");
        assert_eq!(record.payload["tenant"], "acme");
        assert!(broker.get("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewrite_replaces_payload() {
        let broker = InMemoryConfigBroker::new();
        broker.put("r1", json!({ "v": 1 })).await.unwrap();
        broker.put("r1", json!({ "v": 2 })).await.unwrap();

        assert_eq!(broker.len(), 1);
        assert_eq!(broker.get("r1").await.unwrap().unwrap().payload["v"], 2);
    }
}
