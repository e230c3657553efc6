//! Nodes that hand work to the queue and observe it from inside a graph.
//!
//! The usual wiring is `dispatch -> poll` with a conditional edge built by
//! [`poll_route`] that sends the traversal back to `poll` until the task is
//! terminal, the poll caps are hit, or an error is recorded.  [`WaitNode`] is
//! the blocking alternative for graphs that prefer one long suspension.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodes::{ErrorInfo, ErrorKind, NodeError, NodeHandler, State, StateKey};
use queue::{Dispatcher, QueueError, TaskId, TaskRecord, TaskState, Tracker};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::{Next, NodeId};

pub const TASK_ID: StateKey<String> = StateKey::new("task_id");
pub const TASK_STATE: StateKey<TaskState> = StateKey::new("task_state");
pub const TASK_RESULT: StateKey<Value> = StateKey::new("task_result");
pub const DISPATCHED_AT: StateKey<DateTime<Utc>> = StateKey::new("dispatched_at");
pub const POLL_ATTEMPTS: StateKey<u32> = StateKey::new("poll_attempts");
/// Time spent inside poll visits, summed across visits.
pub const POLL_ELAPSED_MS: StateKey<u64> = StateKey::new("poll_elapsed_ms");

/// Bounds on graph-driven polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Sleep before each status check.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
    /// Log an unchanged state every `log_every` attempts.
    #[serde(default = "default_log_every")]
    pub log_every: u32,
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    180
}

fn default_max_elapsed_ms() -> u64 {
    180_000
}

fn default_log_every() -> u32 {
    10
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
            max_elapsed_ms: default_max_elapsed_ms(),
            log_every: default_log_every(),
        }
    }
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

/// Builds the job configuration payload from the State.
pub type PayloadFn = Arc<dyn Fn(&State) -> Result<Value, NodeError> + Send + Sync>;

/// Writes the job configuration under the request id, publishes the job and
/// records the task id.  Dispatch is not retried: the queue does not
/// deduplicate.
pub struct DispatchNode {
    dispatcher: Dispatcher,
    job_ref: String,
    payload: PayloadFn,
}

impl DispatchNode {
    pub fn new<F>(dispatcher: Dispatcher, job_ref: impl Into<String>, payload: F) -> Self
    where
        F: Fn(&State) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        Self { dispatcher, job_ref: job_ref.into(), payload: Arc::new(payload) }
    }

    fn dispatch_error(message: impl Into<String>) -> ErrorInfo {
        ErrorInfo::new(ErrorKind::Dispatch, message).at_node("dispatch")
    }
}

#[async_trait]
impl NodeHandler for DispatchNode {
    #[instrument(skip_all, fields(request_id = %state.request_id(), job_ref = %self.job_ref))]
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        let payload = match (self.payload)(state) {
            Ok(payload) => payload,
            Err(e) => {
                state.set_error(Self::dispatch_error(format!(
                    "could not build job configuration: {}",
                    e.message()
                )));
                return Ok(());
            }
        };

        let job_id = state.request_id().to_owned();
        match self.dispatcher.submit_with_config(&job_id, &self.job_ref, payload).await {
            Ok(task_id) => {
                state.set(TASK_ID, task_id.to_string())?;
                state.set(DISPATCHED_AT, Utc::now())?;
                state.set(POLL_ATTEMPTS, 0)?;
                state.set(POLL_ELAPSED_MS, 0)?;
                state.remove(TASK_STATE);
                state.remove(TASK_RESULT);
                info!(task_id = %task_id, "job dispatched");
            }
            Err(e) => {
                warn!(error = %e, "dispatch failed");
                state.set_error(Self::dispatch_error(e.to_string()));
            }
        }
        Ok(())
    }
}

/// One poll per visit: sleep `interval`, check the task, record what was seen.
pub struct PollNode {
    tracker: Tracker,
    policy: PollPolicy,
}

impl PollNode {
    pub fn new(tracker: Tracker, policy: PollPolicy) -> Self {
        Self { tracker, policy }
    }
}

#[async_trait]
impl NodeHandler for PollNode {
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        let Some(task_id) = state.get(TASK_ID) else {
            state.set_error(
                ErrorInfo::new(ErrorKind::Task, "no dispatched task to poll").at_node("poll"),
            );
            return Ok(());
        };
        let task_id = TaskId::from(task_id);

        let started = Instant::now();
        sleep(self.policy.interval()).await;
        let polled = self.tracker.poll(&task_id).await;

        let attempts = state.get(POLL_ATTEMPTS).unwrap_or(0) + 1;
        let elapsed_ms =
            state.get(POLL_ELAPSED_MS).unwrap_or(0) + started.elapsed().as_millis() as u64;
        state.set(POLL_ATTEMPTS, attempts)?;
        state.set(POLL_ELAPSED_MS, elapsed_ms)?;

        let record = match polled {
            Ok(record) => record,
            Err(QueueError::TaskNotFound(id)) => {
                state.set_error(unknown_task(&id, "poll"));
                return Ok(());
            }
            Err(e) => return Err(NodeError::Retryable(e.to_string())),
        };

        let previous = state.get(TASK_STATE);
        state.set(TASK_STATE, record.state)?;
        if previous != Some(record.state) {
            info!(task_id = %task_id, state = %record.state, attempts, "task state changed");
        } else if self.policy.log_every > 0 && attempts % self.policy.log_every == 0 {
            debug!(
                task_id = %task_id,
                state = %record.state,
                attempts,
                elapsed_ms,
                "still waiting for task"
            );
        }

        if record.state.is_terminal() {
            record_outcome(state, record, "poll")?;
            return Ok(());
        }

        if attempts >= self.policy.max_attempts || elapsed_ms >= self.policy.max_elapsed_ms {
            warn!(task_id = %task_id, attempts, elapsed_ms, "gave up polling");
            state.set_error(
                ErrorInfo::new(
                    ErrorKind::Timeout,
                    format!("task {task_id} still {} after {attempts} polls", record.state),
                )
                .at_node("poll")
                .with_detail(json!({
                    "task_id": task_id,
                    "attempts": attempts,
                    "elapsed_ms": elapsed_ms,
                    "last_state": record.state,
                })),
            );
        }
        Ok(())
    }
}

/// Blocks on [`Tracker::wait`] for at most `timeout`.
pub struct WaitNode {
    tracker: Tracker,
    timeout: Duration,
}

impl WaitNode {
    pub fn new(tracker: Tracker, timeout: Duration) -> Self {
        Self { tracker, timeout }
    }
}

#[async_trait]
impl NodeHandler for WaitNode {
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        let Some(task_id) = state.get(TASK_ID) else {
            state.set_error(
                ErrorInfo::new(ErrorKind::Task, "no dispatched task to wait for").at_node("wait"),
            );
            return Ok(());
        };

        let record = match self.tracker.wait(&TaskId::from(task_id), self.timeout).await {
            Ok(record) => record,
            Err(QueueError::TaskNotFound(id)) => {
                state.set_error(unknown_task(&id, "wait"));
                return Ok(());
            }
            Err(e) => return Err(NodeError::Retryable(e.to_string())),
        };
        state.set(TASK_STATE, record.state)?;
        record_outcome(state, record, "wait")?;
        Ok(())
    }
}

fn unknown_task(id: &str, node: &str) -> ErrorInfo {
    ErrorInfo::new(ErrorKind::Task, format!("task {id} is unknown to the queue")).at_node(node)
}

fn record_outcome(state: &mut State, record: TaskRecord, node: &str) -> Result<(), NodeError> {
    match record.state {
        TaskState::Succeeded => {
            state.set(TASK_RESULT, record.result.unwrap_or(Value::Null))?;
        }
        TaskState::Failed => {
            let message = record.error.unwrap_or_else(|| "remote job failed".to_owned());
            state.set_error(
                ErrorInfo::new(ErrorKind::Task, message)
                    .at_node(node)
                    .with_detail(json!({ "task_id": record.task_id, "attempts": record.attempts })),
            );
        }
        TaskState::TimedOut => {
            state.set_error(
                ErrorInfo::new(
                    ErrorKind::Timeout,
                    format!("task {} did not finish in time", record.task_id),
                )
                .at_node(node)
                .with_detail(json!({ "task_id": record.task_id, "last_state": record.state })),
            );
        }
        TaskState::Queued | TaskState::Running => {}
    }
    Ok(())
}

/// Conditional edge for a poll loop: back to `poll` while the task is still
/// in flight and nothing failed, otherwise on to `next`.  Success, failure
/// and timeout all continue to `next`, which inspects the error slot.
pub fn poll_route<N: NodeId>(
    poll: N,
    next: Next<N>,
) -> impl Fn(&State) -> Next<N> + Send + Sync + 'static {
    move |state: &State| {
        if state.has_error() {
            return next;
        }
        match state.get(TASK_STATE) {
            Some(task_state) if task_state.is_terminal() => next,
            _ => Next::Node(poll),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue::{
        ConfigBroker, DispatchConfig, InMemoryConfigBroker, InMemoryTaskBackend, QueueMessage, TaskBackend,
        TrackerConfig,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        Poll,
        Format,
    }

    impl NodeId for Step {
        fn name(&self) -> &'static str {
            match self {
                Step::Poll => "poll",
                Step::Format => "format",
            }
        }
    }

    fn tracker(backend: &Arc<InMemoryTaskBackend>) -> Tracker {
        Tracker::new(backend.clone(), TrackerConfig::default())
    }

    fn policy(max_attempts: u32) -> PollPolicy {
        PollPolicy { interval_ms: 100, max_attempts, max_elapsed_ms: 60_000, log_every: 2 }
    }

    #[test]
    fn route_loops_until_terminal_or_error() {
        let route = poll_route(Step::Poll, Next::Node(Step::Format));
        let mut state = State::new("r1");
        assert_eq!(route(&state), Next::Node(Step::Poll));

        state.set(TASK_STATE, TaskState::Running).unwrap();
        assert_eq!(route(&state), Next::Node(Step::Poll));

        state.set(TASK_STATE, TaskState::Succeeded).unwrap();
        assert_eq!(route(&state), Next::Node(Step::Format));

        let mut state = State::new("r2").with(TASK_STATE, TaskState::Running).unwrap();
        state.set_error(ErrorInfo::new(ErrorKind::Timeout, "gave up"));
        assert_eq!(route(&state), Next::Node(Step::Format));
    }

    #[tokio::test]
    async fn dispatch_records_task_and_config() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let broker = Arc::new(InMemoryConfigBroker::new());
        let dispatcher =
            Dispatcher::new(backend.clone(), broker.clone(), DispatchConfig::default());
        let node = DispatchNode::new(dispatcher, "execute", |state: &State| {
            Ok(json!({ "tenant": "acme", "requestId": state.request_id() }))
        });

        let mut state = State::new("r1");
        node.handle(&mut state).await.unwrap();

        assert!(!state.has_error());
        let task_id = state.get(TASK_ID).unwrap();
        assert_eq!(state.get(POLL_ATTEMPTS), Some(0));
        assert!(state.contains(DISPATCHED_AT));
        assert_eq!(broker.get("r1").await.unwrap().unwrap().payload["requestId"], "r1");
        let record = backend.fetch(&TaskId::from(task_id)).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn dispatch_failure_sets_dispatch_error() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let broker = Arc::new(InMemoryConfigBroker::new());
        let dispatcher =
            Dispatcher::new(backend.clone(), broker, DispatchConfig { max_args_bytes: 4 });
        let node = DispatchNode::new(dispatcher, "execute", |_: &State| Ok(json!({})));

        let mut state = State::new("r1");
        node.handle(&mut state).await.unwrap();

        assert_eq!(state.error().unwrap().kind, ErrorKind::Dispatch);
        assert!(!state.contains(TASK_ID));
        assert_eq!(backend.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_records_success_result() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let id = backend.publish(QueueMessage::new("execute", json!({}))).await.unwrap();
        backend.claim().await.unwrap();
        backend.complete(&id, json!({ "answer": 42 })).await.unwrap();

        let node = PollNode::new(tracker(&backend), policy(3));
        let mut state = State::new("r1").with(TASK_ID, id.to_string()).unwrap();
        node.handle(&mut state).await.unwrap();

        assert_eq!(state.get(TASK_STATE), Some(TaskState::Succeeded));
        assert_eq!(state.get(TASK_RESULT), Some(json!({ "answer": 42 })));
        assert_eq!(state.get(POLL_ATTEMPTS), Some(1));
        assert!(state.get(POLL_ELAPSED_MS).unwrap() >= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_sets_task_error() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let id = backend.publish(QueueMessage::new("execute", json!({}))).await.unwrap();
        backend.claim().await.unwrap();
        backend.fail(&id, "sql syntax error").await.unwrap();

        let node = PollNode::new(tracker(&backend), policy(3));
        let mut state = State::new("r1").with(TASK_ID, id.to_string()).unwrap();
        node.handle(&mut state).await.unwrap();

        let error = state.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Task);
        assert_eq!(error.message, "sql syntax error");
    }

    #[tokio::test(start_paused = true)]
    async fn poll_cap_sets_timeout_descriptor() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let id = backend.publish(QueueMessage::new("execute", json!({}))).await.unwrap();
        backend.claim().await.unwrap();

        let node = PollNode::new(tracker(&backend), policy(2));
        let mut state = State::new("r1").with(TASK_ID, id.to_string()).unwrap();

        node.handle(&mut state).await.unwrap();
        assert!(!state.has_error());
        node.handle(&mut state).await.unwrap();

        let error = state.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.detail["attempts"], 2);
        assert_eq!(error.detail["last_state"], "running");
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_cap_also_stops_polling() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let id = backend.publish(QueueMessage::new("execute", json!({}))).await.unwrap();

        let policy =
            PollPolicy { interval_ms: 500, max_attempts: 100, max_elapsed_ms: 1_000, log_every: 0 };
        let node = PollNode::new(tracker(&backend), policy);
        let mut state = State::new("r1").with(TASK_ID, id.to_string()).unwrap();

        node.handle(&mut state).await.unwrap();
        assert!(!state.has_error());
        node.handle(&mut state).await.unwrap();
        assert_eq!(state.error().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(state.get(TASK_STATE), Some(TaskState::Queued));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_task_id_is_a_task_error() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let node = PollNode::new(tracker(&backend), policy(3));
        let mut state = State::new("r1");
        node.handle(&mut state).await.unwrap();
        assert_eq!(state.error().unwrap().kind, ErrorKind::Task);

        let mut state = State::new("r1").with(TASK_ID, "ghost".to_string()).unwrap();
        node.handle(&mut state).await.unwrap();
        assert!(state.error().unwrap().message.contains("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_node_records_result_once_task_finishes() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let id = backend.publish(QueueMessage::new("execute", json!({}))).await.unwrap();
        let finisher = {
            let backend = backend.clone();
            let id = id.clone();
            tokio::spawn(async move {
                backend.claim().await.unwrap();
                sleep(Duration::from_millis(1_500)).await;
                backend.complete(&id, json!({ "answer": 42 })).await.unwrap();
            })
        };

        let node = WaitNode::new(tracker(&backend), Duration::from_secs(30));
        let mut state = State::new("r1").with(TASK_ID, id.to_string()).unwrap();
        node.handle(&mut state).await.unwrap();
        finisher.await.unwrap();

        assert!(!state.has_error());
        assert_eq!(state.get(TASK_STATE), Some(TaskState::Succeeded));
        assert_eq!(state.get(TASK_RESULT), Some(json!({ "answer": 42 })));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_node_times_out_into_error_slot() {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let id = backend.publish(QueueMessage::new("execute", json!({}))).await.unwrap();

        let node = WaitNode::new(tracker(&backend), Duration::from_secs(2));
        let mut state = State::new("r1").with(TASK_ID, id.to_string()).unwrap();
        node.handle(&mut state).await.unwrap();

        assert_eq!(state.get(TASK_STATE), Some(TaskState::TimedOut));
        assert_eq!(state.error().unwrap().kind, ErrorKind::Timeout);
    }
}
