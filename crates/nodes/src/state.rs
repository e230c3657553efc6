//! The mutable context threaded through one workflow traversal.
//!
//! `State` always carries a request identifier and an error slot.  Every
//! other value lives in an ordered JSON map and is read and written through
//! typed [`StateKey`]s, so a node that declares `StateKey<String>` can never
//! silently store a number under the same name.  Keeping the payload as JSON
//! keeps the whole State serialisable for checkpointing; heavy objects are
//! referenced through registry [`Handle`](crate::Handle)s instead.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StateError;

// ---------------------------------------------------------------------------
// StateKey
// ---------------------------------------------------------------------------

/// A named, typed slot in [`State`].
///
/// Keys are usually declared as constants next to the nodes that own them:
///
/// ```
/// use nodes::StateKey;
/// pub const TASK_ID: StateKey<String> = StateKey::new("task_id");
/// ```
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// Error slot
// ---------------------------------------------------------------------------

/// Category of a failure recorded in the State's error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A node handler returned an error or panicked.
    Handler,
    /// Writing the job configuration or publishing the job failed.
    Dispatch,
    /// The remote job reported failure.
    Task,
    /// Polling or waiting exceeded its bound.
    Timeout,
    /// A routing function chose a node the graph does not contain.
    Routing,
    /// The executor's optional step limit was reached.
    StepLimit,
    /// A registry handle or cached resource was gone and could not be rebuilt.
    MissingResource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Handler => "handler",
            Self::Dispatch => "dispatch",
            Self::Task => "task",
            Self::Timeout => "timeout",
            Self::Routing => "routing",
            Self::StepLimit => "step_limit",
            Self::MissingResource => "missing_resource",
        };
        f.write_str(s)
    }
}

/// A normalised, human-readable failure stored in [`State`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// Name of the node that recorded the failure, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub message: String,
    /// Structured detail (attempt counts, last task state, ...).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, node: None, message: message.into(), detail: Value::Null }
    }

    pub fn at_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} error in '{}': {}", self.kind, node, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Mutable context of one request traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    request_id: String,
    #[serde(default)]
    error: Option<ErrorInfo>,
    #[serde(default)]
    values: Map<String, Value>,
}

impl State {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), error: None, values: Map::new() }
    }

    /// Builder-style typed insert, for constructing request States in tests
    /// and entry points.
    pub fn with<T: Serialize>(mut self, key: StateKey<T>, value: T) -> Result<Self, StateError> {
        self.set(key, value)?;
        Ok(self)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    // ------ error slot ------

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Record a failure.  A later failure replaces an earlier one; the engine
    /// logs every failure as it is recorded.
    pub fn set_error(&mut self, error: ErrorInfo) {
        self.error = Some(error);
    }

    pub fn clear_error(&mut self) -> Option<ErrorInfo> {
        self.error.take()
    }

    // ------ typed access ------

    /// Read a typed value.  Returns `Ok(None)` when the key is absent or null.
    pub fn try_get<T: DeserializeOwned>(&self, key: StateKey<T>) -> Result<Option<T>, StateError> {
        match self.values.get(key.name()) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|source| StateError::Decode { key: key.name(), source }),
        }
    }

    /// Read a typed value, treating an incompatible value as absent.
    pub fn get<T: DeserializeOwned>(&self, key: StateKey<T>) -> Option<T> {
        self.try_get(key).ok().flatten()
    }

    pub fn set<T: Serialize>(&mut self, key: StateKey<T>, value: T) -> Result<(), StateError> {
        let value = serde_json::to_value(value)
            .map_err(|source| StateError::Encode { key: key.name(), source })?;
        self.values.insert(key.name().to_owned(), value);
        Ok(())
    }

    pub fn contains<T>(&self, key: StateKey<T>) -> bool {
        self.values.get(key.name()).is_some_and(|v| !v.is_null())
    }

    pub fn remove<T>(&mut self, key: StateKey<T>) -> Option<Value> {
        self.values.shift_remove(key.name())
    }

    // ------ untyped access (serialisation boundaries, diagnostics) ------

    pub fn raw(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn raw_get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn insert_raw(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Overlay `incoming` on top of this State: the incoming request id and
    /// values win, the error slot is reset.  Used when resuming a persisted
    /// conversation with a new request.
    pub fn resume_with(&mut self, incoming: State) {
        self.request_id = incoming.request_id;
        self.error = None;
        for (k, v) in incoming.values {
            self.values.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ANSWER: StateKey<i64> = StateKey::new("answer");
    const LABEL: StateKey<String> = StateKey::new("label");

    #[test]
    fn typed_round_trip_through_keys() {
        let mut state = State::new("r1");
        state.set(ANSWER, 42).unwrap();
        state.set(LABEL, "sql".to_string()).unwrap();

        assert_eq!(state.get(ANSWER), Some(42));
        assert_eq!(state.get(LABEL).as_deref(), Some("sql"));
        assert!(state.contains(ANSWER));
        assert_eq!(state.request_id(), "r1");
    }

    #[test]
    fn incompatible_value_is_reported_by_try_get() {
        let mut state = State::new("r1");
        state.insert_raw("answer", json!("not a number"));

        assert!(state.get(ANSWER).is_none());
        assert!(matches!(state.try_get(ANSWER), Err(StateError::Decode { key: "answer", .. })));
    }

    #[test]
    fn null_counts_as_absent() {
        let mut state = State::new("r1");
        state.insert_raw("answer", Value::Null);
        assert!(!state.contains(ANSWER));
        assert_eq!(state.try_get(ANSWER).unwrap(), None);
    }

    #[test]
    fn error_slot_set_and_clear() {
        let mut state = State::new("r1");
        assert!(!state.has_error());

        state.set_error(ErrorInfo::new(ErrorKind::Timeout, "gave up").at_node("poll"));
        assert_eq!(state.error().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(state.error().unwrap().to_string(), "timeout error in 'poll': gave up");

        let cleared = state.clear_error().unwrap();
        assert_eq!(cleared.node.as_deref(), Some("poll"));
        assert!(state.error().is_none());
    }

    #[test]
    fn resume_overlays_incoming_values() {
        let mut persisted = State::new("r1");
        persisted.set(LABEL, "old".to_string()).unwrap();
        persisted.set(ANSWER, 1).unwrap();
        persisted.set_error(ErrorInfo::new(ErrorKind::Task, "boom"));

        let incoming = State::new("r2").with(LABEL, "new".to_string()).unwrap();
        persisted.resume_with(incoming);

        assert_eq!(persisted.request_id(), "r2");
        assert_eq!(persisted.get(LABEL).as_deref(), Some("new"));
        assert_eq!(persisted.get(ANSWER), Some(1));
        assert!(!persisted.has_error());
    }

    #[test]
    fn resume_starts_with_a_clean_error_slot() {
        let mut persisted = State::new("r1");
        persisted.set_error(ErrorInfo::new(ErrorKind::Task, "old failure"));

        let mut incoming = State::new("r2");
        incoming.set_error(ErrorInfo::new(ErrorKind::Timeout, "stale timeout"));
        persisted.resume_with(incoming);

        assert!(persisted.error().is_none());
        assert_eq!(persisted.request_id(), "r2");
    }

    #[test]
    fn serialises_with_insertion_order() {
        let mut state = State::new("r1");
        state.insert_raw("zeta", json!(1));
        state.insert_raw("alpha", json!(2));

        let text = serde_json::to_string(&state).unwrap();
        assert!(text.find("zeta").unwrap() < text.find("alpha").unwrap());

        let back: State = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
    }
}
