//! `queue` crate: hands long-running work to out-of-process workers.
//!
//! - [`ConfigBroker`]: key/value store shared by dispatcher and worker.
//! - [`Dispatcher`]: publishes `{jobRef, args}` messages, returns a task id.
//! - [`Tracker`]: status / poll / bounded wait over [`TaskRecord`]s.
//! - [`Worker`]: claims messages and runs registered [`JobFunction`]s.
//! - [`retry`]: provider-level retry with back-off for transient failures.
//!
//! Backends are pluggable through [`TaskBackend`]; the in-memory variants here
//! serve tests and single-process deployments, the `db` crate provides
//! Postgres-backed ones.

pub mod backend;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job_config;
pub mod message;
pub mod retry;
pub mod task;
pub mod tracker;
pub mod worker;

pub use backend::{ClaimedTask, InMemoryTaskBackend, TaskBackend};
pub use broker::{ConfigBroker, ConfigRecord, InMemoryConfigBroker};
pub use config::{DispatchConfig, TrackerConfig, WorkerConfig};
pub use dispatcher::Dispatcher;
pub use error::QueueError;
pub use job_config::JobConfig;
pub use message::QueueMessage;
pub use retry::{is_transient, retry_transient, Retried, RetryError, RetryPolicy};
pub use task::{TaskId, TaskRecord, TaskState};
pub use tracker::Tracker;
pub use worker::{JobContext, JobError, JobFunction, JobRegistry, Worker, WorkerStats};
