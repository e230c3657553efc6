//! `relay-flow.toml`: one section per component, every field defaulted.
//!
//! ```toml
//! database_url = "postgres://localhost/relay_flow"
//!
//! [database]
//! max_connections = 10
//!
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [poll]
//! interval_ms = 1000
//! max_attempts = 180
//! ```

use std::path::Path;

use anyhow::Context;
use db::PoolConfig;
use engine::{ExecutorConfig, PollPolicy};
use queue::{DispatchConfig, RetryPolicy, TrackerConfig, WorkerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Postgres URL.  Without one every component runs in memory.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub database: PoolConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub poll: PollPolicy,
    /// Provider-level retry for transient model errors.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl AppConfig {
    /// Read the file at `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            database_url = "postgres://db/relay"

            [poll]
            interval_ms = 250

            [worker]
            concurrency = 8

            [database]
            acquire_timeout_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://db/relay"));
        assert_eq!(config.poll.interval_ms, 250);
        assert_eq!(config.poll.max_attempts, 180);
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.database.acquire_timeout_ms, 1000);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.executor.max_steps, None);
    }

    #[test]
    fn no_path_means_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.tracker.default_wait_timeout_secs, 180);
    }
}
