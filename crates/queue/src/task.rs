//! Task identity and lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::QueueError;

/// Identifier returned by the dispatcher.  Opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Lifecycle state of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Observed by the tracker when a bounded wait expires.  Never stored by
    /// a worker or backend.
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Transitions a backend may record.  Progress updates keep `Running`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued    => write!(f, "queued"),
            Self::Running   => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
            Self::TimedOut  => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued"    => Ok(Self::Queued),
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other       => Err(format!("unknown task state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskRecord
// ---------------------------------------------------------------------------

/// Observable snapshot of one dispatched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub job_ref: String,
    pub state: TaskState,
    /// Latest progress metadata reported by the worker.
    #[serde(default)]
    pub progress: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How many times a worker has claimed this task.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn queued(task_id: TaskId, job_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            job_ref: job_ref.into(),
            state: TaskState::Queued,
            progress: Value::Null,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, enforcing monotonic transitions.
    pub fn transition(&mut self, next: TaskState) -> Result<(), QueueError> {
        if !self.state.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                task_id: self.task_id.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The same record as seen by a caller whose wait expired.
    pub fn into_timed_out(mut self) -> Self {
        if !self.state.is_terminal() {
            self.state = TaskState::TimedOut;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut record = TaskRecord::queued(TaskId::from("t1"), "execute");
        record.transition(TaskState::Running).unwrap();
        record.transition(TaskState::Running).unwrap();
        record.transition(TaskState::Succeeded).unwrap();
        assert!(record.state.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [TaskState::Succeeded, TaskState::Failed, TaskState::TimedOut] {
            let all =
                [TaskState::Queued, TaskState::Running, TaskState::Succeeded, TaskState::Failed];
            for next in all {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn backwards_transition_is_rejected() {
        let mut record = TaskRecord::queued(TaskId::from("t1"), "execute");
        record.transition(TaskState::Running).unwrap();
        let err = record.transition(TaskState::Queued).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition { from: TaskState::Running, to: TaskState::Queued, .. }
        ));
        assert_eq!(record.state, TaskState::Running);
    }

    #[test]
    fn workers_never_store_timed_out() {
        assert!(!TaskState::Running.can_transition_to(TaskState::TimedOut));
        let record = TaskRecord::queued(TaskId::from("t1"), "execute").into_timed_out();
        assert_eq!(record.state, TaskState::TimedOut);
    }

    #[test]
    fn timing_out_keeps_a_terminal_outcome() {
        let mut record = TaskRecord::queued(TaskId::from("t1"), "execute");
        record.transition(TaskState::Failed).unwrap();
        assert_eq!(record.into_timed_out().state, TaskState::Failed);
    }

    #[test]
    fn state_string_round_trip() {
        for state in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::TimedOut,
        ] {
            assert_eq!(state.to_string().parse::<TaskState>().unwrap(), state);
        }
        assert!("dead_lettered".parse::<TaskState>().is_err());
    }
}
