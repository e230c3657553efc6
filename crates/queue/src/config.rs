//! Queue-side configuration.  Every section deserialises with defaults so a
//! partial TOML file is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on the serialised size of a message's `args`.
    #[serde(default = "default_max_args_bytes")]
    pub max_args_bytes: usize,
}

fn default_max_args_bytes() -> usize {
    16 * 1024
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_args_bytes: default_max_args_bytes() }
    }
}

/// Tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Delay between status checks inside a blocking wait.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound used by callers that block without choosing their own timeout.
    #[serde(default = "default_wait_timeout_secs")]
    pub default_wait_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_wait_timeout_secs() -> u64 {
    180
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.default_wait_timeout_secs)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of claim loops run concurrently by one worker process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sleep between claims when the queue is empty.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_idle_interval_ms() -> u64 {
    250
}

impl WorkerConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            idle_interval_ms: default_idle_interval_ms(),
        }
    }
}
