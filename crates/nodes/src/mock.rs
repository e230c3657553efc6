//! `MockNode`: a test double for `NodeHandler`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::{NodeError, NodeHandler, State};

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Insert the given values into State.
    SetValues(Map<String, Value>),
    /// Fail with a `Retryable` error the first `n` calls, then set the values.
    FlakyThen(u32, Map<String, Value>),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Panic inside the handler.
    Panic(String),
}

/// A mock node that records every call it receives and behaves as the test
/// specifies.
pub struct MockNode {
    /// Label used in test assertions; also written to State as `last_node`.
    pub name: String,
    /// What the node will do when `handle` is called.
    pub behaviour: MockBehaviour,
    /// Request ids seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockNode {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self { name: name.into(), behaviour, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Create a mock that always succeeds, inserting `values` (a JSON object).
    pub fn returning(name: impl Into<String>, values: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::SetValues(as_object(values)))
    }

    /// Create a mock that fails retryably `failures` times, then succeeds.
    pub fn flaky(name: impl Into<String>, failures: u32, values: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::FlakyThen(failures, as_object(values)))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that panics.
    pub fn panicking(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Panic(msg.into()))
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

fn as_object(values: Value) -> Map<String, Value> {
    match values {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

fn apply(state: &mut State, name: &str, values: &Map<String, Value>) {
    state.insert_raw("last_node", Value::String(name.to_owned()));
    for (k, v) in values {
        state.insert_raw(k.clone(), v.clone());
    }
}

#[async_trait]
impl NodeHandler for MockNode {
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push(state.request_id().to_owned());
            calls.len() as u32
        };

        match &self.behaviour {
            MockBehaviour::SetValues(values) => {
                apply(state, &self.name, values);
                Ok(())
            }
            MockBehaviour::FlakyThen(failures, values) => {
                if call <= *failures {
                    let message = format!("{} flaked on call {call}", self.name);
                    return Err(NodeError::Retryable(message));
                }
                apply(state, &self.name, values);
                Ok(())
            }
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg)     => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::Panic(msg)         => panic!("{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn returning_mock_sets_values_and_counts_calls() {
        let node = MockNode::returning("classify", json!({ "route": "sql" }));
        let mut state = State::new("r1");

        node.handle(&mut state).await.unwrap();

        assert_eq!(node.call_count(), 1);
        assert_eq!(state.raw_get("route"), Some(&json!("sql")));
        assert_eq!(state.raw_get("last_node"), Some(&json!("classify")));
        assert_eq!(node.calls.lock().as_slice(), ["r1".to_string()]);
    }

    #[tokio::test]
    async fn flaky_mock_recovers_after_configured_failures() {
        let node = MockNode::flaky("llm", 2, json!({ "ok": true }));
        let mut state = State::new("r1");

        assert!(matches!(node.handle(&mut state).await, Err(NodeError::Retryable(_))));
        assert!(matches!(node.handle(&mut state).await, Err(NodeError::Retryable(_))));
        node.handle(&mut state).await.unwrap();
        assert_eq!(state.raw_get("ok"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn fn_node_runs_closure() {
        let node = crate::from_fn(|state: &mut State| {
            let id = state.request_id().to_owned();
            state.insert_raw("seen", json!(id));
            Ok(())
        });
        let mut state = State::new("r9");
        node.handle(&mut state).await.unwrap();
        assert_eq!(state.raw_get("seen"), Some(&json!("r9")));
    }
}
