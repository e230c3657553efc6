//! The request pipeline graph.
//!
//! ```text
//! validate ──error──────────────────────────────┐
//!    │ runLocally                               │
//!    ├──────────► prepare ──► execute ──────────┤
//!    │                                          ▼
//!    └──► dispatch ──► poll ◄─┐ (in flight)   format ──► End
//!                        └────┴──────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use engine::remote::TASK_RESULT;
use engine::{
    poll_route, DispatchNode, EngineError, Graph, GraphBuilder, Next, NodeId, PollNode, PollPolicy,
};
use nodes::{
    from_fn, Category, ErrorInfo, ErrorKind, Handle, NodeError, NodeHandler, ObjectRegistry, State,
    StateKey,
};
use queue::{Dispatcher, JobConfig, Tracker};
use serde_json::Value;
use tracing::{info, warn};

use crate::jobs::EXECUTE_JOB;
use crate::resources::{Answering, ResourceSession};

pub const QUESTION: StateKey<String> = StateKey::new("question");
/// Job configuration payload (`{tenant, connectionType, ...}`).
pub const CONNECTION: StateKey<JobConfig> = StateKey::new("connection");
/// Registry handle of the local resource session.
pub const SESSION: StateKey<Handle> = StateKey::new("session");
pub const RESPONSE: StateKey<String> = StateKey::new("response");

/// Behaviour flag selecting the in-process execution path.
pub const RUN_LOCALLY_FLAG: &str = "runLocally";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStep {
    Validate,
    Prepare,
    Execute,
    Dispatch,
    Poll,
    Format,
}

impl NodeId for RequestStep {
    fn name(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Prepare => "prepare",
            Self::Execute => "execute",
            Self::Dispatch => "dispatch",
            Self::Poll => "poll",
            Self::Format => "format",
        }
    }
}

/// Everything the pipeline's nodes share.
#[derive(Clone)]
pub struct PipelineDeps {
    pub answering: Answering,
    pub registry: Arc<ObjectRegistry>,
    pub dispatcher: Dispatcher,
    pub tracker: Tracker,
    pub poll: PollPolicy,
}

pub fn request_graph(deps: PipelineDeps) -> Result<Graph<RequestStep>, EngineError> {
    use RequestStep::*;

    GraphBuilder::new()
        .add_node(Validate, from_fn(validate))
        .add_node(
            Prepare,
            PrepareNode { answering: deps.answering.clone(), registry: deps.registry.clone() },
        )
        .add_node(
            Execute,
            ExecuteNode { answering: deps.answering, registry: deps.registry.clone() },
        )
        .add_node(Dispatch, DispatchNode::new(deps.dispatcher, EXECUTE_JOB, job_payload))
        .add_node(Poll, PollNode::new(deps.tracker, deps.poll))
        .add_node(Format, FormatNode { registry: deps.registry })
        .add_conditional_edge(
            Validate,
            &[Next::Node(Prepare), Next::Node(Dispatch), Next::Node(Format)],
            route_after_validate,
        )
        .add_conditional_edge(Prepare, &[Next::Node(Execute), Next::Node(Format)], |state| {
            if state.has_error() {
                Next::Node(Format)
            } else {
                Next::Node(Execute)
            }
        })
        .add_edge(Execute, Next::Node(Format))
        .add_conditional_edge(Dispatch, &[Next::Node(Poll), Next::Node(Format)], |state| {
            if state.has_error() {
                Next::Node(Format)
            } else {
                Next::Node(Poll)
            }
        })
        .add_conditional_edge(
            Poll,
            &[Next::Node(Poll), Next::Node(Format)],
            poll_route(Poll, Next::Node(Format)),
        )
        .add_edge(Format, Next::End)
        .set_entry(Validate)
        .build()
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(state: &mut State) -> Result<(), NodeError> {
    let question = state.get(QUESTION).unwrap_or_default();
    if question.trim().is_empty() {
        return Err(NodeError::Fatal("a non-empty question is required".into()));
    }
    let raw = state
        .raw_get(CONNECTION.name())
        .ok_or_else(|| NodeError::Fatal("connection configuration is required".into()))?;
    // Re-parse so a missing field is reported by name.
    JobConfig::from_payload(raw).map_err(|e| NodeError::Fatal(e.to_string()))?;
    Ok(())
}

fn route_after_validate(state: &State) -> Next<RequestStep> {
    if state.has_error() {
        return Next::Node(RequestStep::Format);
    }
    let local = state
        .get(CONNECTION)
        .and_then(|config| config.flag(RUN_LOCALLY_FLAG).and_then(Value::as_bool))
        .unwrap_or(false);
    if local {
        Next::Node(RequestStep::Prepare)
    } else {
        Next::Node(RequestStep::Dispatch)
    }
}

fn job_payload(state: &State) -> Result<Value, NodeError> {
    let mut config = state
        .try_get(CONNECTION)?
        .ok_or_else(|| NodeError::Fatal("connection configuration is required".into()))?;
    let question = state.get(QUESTION).unwrap_or_default();
    config.extra.insert("question".into(), Value::String(question));
    config.to_payload().map_err(|e| NodeError::Fatal(e.to_string()))
}

fn config_with_question(state: &State) -> Result<JobConfig, NodeError> {
    let payload = job_payload(state)?;
    JobConfig::from_payload(&payload).map_err(|e| NodeError::Fatal(e.to_string()))
}

// ---------------------------------------------------------------------------
// prepare / execute (local path)
// ---------------------------------------------------------------------------

/// Opens (or reuses) the resource session and parks it in the registry.
struct PrepareNode {
    answering: Answering,
    registry: Arc<ObjectRegistry>,
}

#[async_trait]
impl NodeHandler for PrepareNode {
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        let config = config_with_question(state)?;
        match self.answering.session(&config).await {
            Ok(session) => {
                let handle = self.registry.store_arc(session, Category::Connection);
                state.set(SESSION, handle)?;
            }
            Err(e) => {
                state.set_error(
                    ErrorInfo::new(ErrorKind::MissingResource, e.to_string()).at_node("prepare"),
                );
            }
        }
        Ok(())
    }
}

/// Answers in-process using the session prepared earlier.
struct ExecuteNode {
    answering: Answering,
    registry: Arc<ObjectRegistry>,
}

impl ExecuteNode {
    /// The session behind the State's handle, rebuilding it when the handle
    /// has gone stale.
    async fn session(
        &self,
        state: &mut State,
        config: &JobConfig,
    ) -> Result<Arc<ResourceSession>, ErrorInfo> {
        if let Some(session) = state
            .get(SESSION)
            .and_then(|handle| self.registry.get::<ResourceSession>(&handle))
        {
            return Ok(session);
        }

        warn!("session handle missing or stale, rebuilding");
        let missing = |e: &dyn std::fmt::Display| {
            ErrorInfo::new(ErrorKind::MissingResource, e.to_string()).at_node("execute")
        };
        self.answering.invalidate(config).map_err(|e| missing(&e))?;
        let session = self.answering.session(config).await.map_err(|e| missing(&e))?;
        let handle = self.registry.store_arc(Arc::clone(&session), Category::Connection);
        state.set(SESSION, handle).map_err(|e| missing(&e))?;
        Ok(session)
    }
}

#[async_trait]
impl NodeHandler for ExecuteNode {
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        let config = config_with_question(state)?;
        let session = match self.session(state, &config).await {
            Ok(session) => session,
            Err(info) => {
                state.set_error(info);
                return Ok(());
            }
        };

        let question = state.get(QUESTION).unwrap_or_default();
        let answer = self
            .answering
            .respond(&session, &question)
            .await
            .map_err(|e| NodeError::Fatal(e.to_string()))?;
        state.set(TASK_RESULT, answer)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// format
// ---------------------------------------------------------------------------

/// Turns the result or the recorded failure into the user-facing response
/// and releases the request's registry entries.
struct FormatNode {
    registry: Arc<ObjectRegistry>,
}

#[async_trait]
impl NodeHandler for FormatNode {
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        if let Some(handle) = state.get(SESSION) {
            self.registry.remove(&handle);
            state.remove(SESSION);
        }

        let response = match (state.error(), state.get(TASK_RESULT)) {
            (Some(error), _) => {
                format!("Sorry, the request could not be completed: {}", error.message)
            }
            (None, Some(result)) => match result.get("answer") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => result.to_string(),
            },
            (None, None) => "No answer was produced.".to_owned(),
        };
        info!(failed = state.has_error(), "response formatted");
        state.set(RESPONSE, response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::EchoResponder;
    use engine::{ExecutorConfig, WorkflowExecutor};
    use queue::{
        DispatchConfig, InMemoryConfigBroker, InMemoryTaskBackend, RetryPolicy, TaskBackend,
        TrackerConfig,
    };
    use serde_json::json;

    struct Fixture {
        executor: WorkflowExecutor<RequestStep>,
        backend: Arc<InMemoryTaskBackend>,
        registry: Arc<ObjectRegistry>,
        answering: Answering,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let backend = Arc::new(InMemoryTaskBackend::new());
        let broker = Arc::new(InMemoryConfigBroker::new());
        let answering = Answering::new(Arc::new(EchoResponder), RetryPolicy::default());
        let registry = Arc::new(ObjectRegistry::new());
        let deps = PipelineDeps {
            answering: answering.clone(),
            registry: registry.clone(),
            dispatcher: Dispatcher::new(backend.clone(), broker, DispatchConfig::default()),
            tracker: Tracker::new(backend.clone(), TrackerConfig::default()),
            poll: PollPolicy {
                interval_ms: 100,
                max_attempts,
                max_elapsed_ms: 60_000,
                log_every: 5,
            },
        };
        let graph = request_graph(deps).expect("pipeline builds");
        Fixture {
            executor: WorkflowExecutor::new(graph, ExecutorConfig::default()),
            backend,
            registry,
            answering,
        }
    }

    fn request(id: &str, local: bool) -> State {
        State::new(id)
            .with(QUESTION, "total sales?".to_string())
            .unwrap()
            .with(
                CONNECTION,
                JobConfig::from_payload(&json!({
                    "tenant": "acme",
                    "connectionType": "postgres",
                    "selectedResource": "gpt-4o",
                    "resourceLocator": "postgres://db/sales",
                    "behaviorFlags": { "runLocally": local }
                }))
                .unwrap(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn local_path_answers_in_process() {
        let f = fixture(3);
        let report = f.executor.run_detailed(request("r1", true), None).await;

        assert_eq!(
            report.path,
            vec![
                RequestStep::Validate,
                RequestStep::Prepare,
                RequestStep::Execute,
                RequestStep::Format
            ]
        );
        assert!(!report.state.has_error());
        assert_eq!(report.state.get(RESPONSE).as_deref(), Some("total sales?"));
        // The session handle is released once the response is formatted.
        assert!(f.registry.is_empty());
        assert!(!report.state.contains(SESSION));
        assert_eq!(f.answering.sessions().len(), 1);
    }

    #[tokio::test]
    async fn stale_handle_is_rebuilt() {
        let f = fixture(3);
        let mut state = request("r1", true);
        let config = config_with_question(&state).unwrap();
        let prepare = PrepareNode { answering: f.answering.clone(), registry: f.registry.clone() };
        prepare.handle(&mut state).await.unwrap();

        f.registry.clear();

        let execute = ExecuteNode { answering: f.answering.clone(), registry: f.registry.clone() };
        execute.handle(&mut state).await.unwrap();
        assert!(!state.has_error());
        assert_eq!(state.get(TASK_RESULT).unwrap()["answer"], "total sales?");
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.answering.sessions().stats().builds, 2);
        assert_eq!(config.tenant, "acme");
    }

    #[tokio::test]
    async fn invalid_request_goes_straight_to_format() {
        let f = fixture(3);
        let state = State::new("r1").with(QUESTION, "q".to_string()).unwrap();
        let report = f.executor.run_detailed(state, None).await;

        assert_eq!(report.path, vec![RequestStep::Validate, RequestStep::Format]);
        let error = report.state.error().unwrap();
        assert_eq!(error.kind, ErrorKind::Handler);
        let response = report.state.get(RESPONSE).unwrap();
        assert!(response.contains("connection configuration is required"));
    }

    #[tokio::test]
    async fn missing_connection_field_is_named() {
        let f = fixture(3);
        let mut state = State::new("r1").with(QUESTION, "q".to_string()).unwrap();
        state.insert_raw("connection", json!({ "tenant": "acme", "connectionType": "postgres" }));

        let state = f.executor.invoke(state, None).await;
        assert!(state.error().unwrap().message.contains("selectedResource"));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_path_times_out_without_a_worker() {
        let f = fixture(3);
        let report = f.executor.run_detailed(request("r1", false), None).await;

        assert_eq!(report.path.iter().filter(|s| **s == RequestStep::Poll).count(), 3);
        assert_eq!(report.state.error().unwrap().kind, ErrorKind::Timeout);
        assert!(report.state.get(RESPONSE).unwrap().starts_with("Sorry"));
        assert_eq!(f.backend.pending_len().await, 1);
        let claimed = f.backend.claim().await.unwrap().unwrap();
        assert_eq!(claimed.message.job_ref, EXECUTE_JOB);
        assert_eq!(claimed.message.job_id(), Some("r1"));
    }
}
