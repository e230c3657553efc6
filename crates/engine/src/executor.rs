//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the central orchestrator:
//! 1. Starts at the graph's entry node with the caller's State.
//! 2. Invokes each node's handler with `&mut State`, retrying
//!    `NodeError::Retryable` with exponential back-off.
//! 3. Records fatal errors, exhausted retries and panics in the State's
//!    error slot, then still resolves the node's outgoing edge.
//! 4. Follows edges until `Next::End`.
//!
//! Nothing escapes as `Err`: `invoke` always returns a State.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use nodes::{ErrorInfo, ErrorKind, NodeError, NodeHandler, State};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::{CheckpointStore, Graph, Next, NodeId};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of times a retryable node failure will be retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Optional safety stop on the number of node visits per traversal.
    /// Loop caps normally live in the nodes themselves.
    #[serde(default)]
    pub max_steps: Option<usize>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

/// Upper bound on a single back-off sleep.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

impl ExecutorConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Back-off before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
    /// capped at one minute.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.retry_base_delay().checked_mul(factor))
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_steps: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Output of a traversal
// ---------------------------------------------------------------------------

/// Final State plus the path the traversal took.
#[derive(Debug)]
pub struct TraversalReport<N> {
    pub state: State,
    /// Visited nodes in order; a node appears once per visit.
    pub path: Vec<N>,
}

impl<N> TraversalReport<N> {
    pub fn steps(&self) -> usize {
        self.path.len()
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Runs traversals over one immutable graph.  Share it behind an `Arc`; any
/// number of traversals may run concurrently.
pub struct WorkflowExecutor<N: NodeId> {
    graph: Arc<Graph<N>>,
    config: ExecutorConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl<N: NodeId> WorkflowExecutor<N> {
    pub fn new(graph: Graph<N>, config: ExecutorConfig) -> Self {
        Self { graph: Arc::new(graph), config, checkpoints: None }
    }

    /// Persist final States per thread id and resume from them.
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn graph(&self) -> &Graph<N> {
        &self.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one traversal and return the final State.
    pub async fn invoke(&self, state: State, thread_id: Option<&str>) -> State {
        self.run_detailed(state, thread_id).await.state
    }

    /// Run one traversal and return the final State with the visited path.
    #[instrument(skip(self, state), fields(request_id = %state.request_id()))]
    pub async fn run_detailed(&self, state: State, thread_id: Option<&str>) -> TraversalReport<N> {
        let mut state = match thread_id {
            Some(thread_id) => self.resume(thread_id, state).await,
            None => state,
        };
        let mut path = Vec::new();
        let mut current = Next::Node(self.graph.entry());

        while let Next::Node(id) = current {
            if let Some(max_steps) = self.config.max_steps {
                if path.len() >= max_steps {
                    let info = ErrorInfo::new(
                        ErrorKind::StepLimit,
                        format!("traversal stopped after {max_steps} steps"),
                    )
                    .at_node(id.name())
                    .with_detail(json!({ "max_steps": max_steps }));
                    warn!(error = %info, "step limit reached");
                    state.set_error(info);
                    break;
                }
            }

            let Some(handler) = self.graph.handler(id) else {
                let info = ErrorInfo::new(
                    ErrorKind::Routing,
                    format!("routed to node '{}' which is not in the graph", id.name()),
                );
                error!(error = %info, "routing failed");
                state.set_error(info);
                break;
            };

            path.push(id);
            debug!(node = id.name(), step = path.len(), "visiting node");

            if let Err(info) = self.execute_with_retry(id, handler.as_ref(), &mut state).await {
                error!(error = %info, "node failed");
                state.set_error(info);
            }

            current = match self.graph.route(id) {
                Some(route) => route.resolve(&state),
                None => Next::End,
            };
        }

        info!(
            steps = path.len(),
            failed = state.has_error(),
            "traversal finished"
        );

        if let Some(thread_id) = thread_id {
            self.persist(thread_id, &state).await;
        }

        TraversalReport { state, path }
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single node with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        node_id: N,
        node: &dyn NodeHandler,
        state: &mut State,
    ) -> Result<(), ErrorInfo> {
        let mut attempts = 0u32;

        loop {
            let outcome = AssertUnwindSafe(node.handle(state)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => return Ok(()),

                Ok(Err(NodeError::Fatal(msg))) => {
                    return Err(ErrorInfo::new(ErrorKind::Handler, msg).at_node(node_id.name()));
                }

                Ok(Err(NodeError::Retryable(msg))) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        return Err(ErrorInfo::new(
                            ErrorKind::Handler,
                            format!("exceeded retry limit: {msg}"),
                        )
                        .at_node(node_id.name())
                        .with_detail(json!({ "attempts": attempts })));
                    }

                    let delay = self.config.retry_delay(attempts);

                    warn!(
                        "node '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        node_id.name(), attempts, self.config.max_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }

                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_owned());
                    return Err(ErrorInfo::new(
                        ErrorKind::Handler,
                        format!("handler panicked: {msg}"),
                    )
                    .at_node(node_id.name()));
                }
            }
        }
    }

    async fn resume(&self, thread_id: &str, incoming: State) -> State {
        let Some(store) = &self.checkpoints else {
            return incoming;
        };
        match store.load(thread_id).await {
            Ok(Some(mut saved)) => {
                debug!(thread_id, "resuming from checkpoint");
                saved.resume_with(incoming);
                saved
            }
            Ok(None) => incoming,
            Err(e) => {
                warn!(thread_id, error = %e, "checkpoint load failed, starting fresh");
                incoming
            }
        }
    }

    async fn persist(&self, thread_id: &str, state: &State) {
        if let Some(store) = &self.checkpoints {
            if let Err(e) = store.save(thread_id, state).await {
                warn!(thread_id, error = %e, "checkpoint save failed");
            }
        }
    }
}
