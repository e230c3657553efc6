//! Wire format of a queued job.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{jobRef, args}`: kept small.  Large configuration is written to the
/// config broker and referenced by a job id inside `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Name of the registered job function the worker should run.
    pub job_ref: String,
    #[serde(default)]
    pub args: Value,
}

impl QueueMessage {
    pub fn new(job_ref: impl Into<String>, args: Value) -> Self {
        Self { job_ref: job_ref.into(), args }
    }

    /// The `jobId` argument, when the message references a config record.
    pub fn job_id(&self) -> Option<&str> {
        self.args.get("jobId").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uses_camel_case_on_the_wire() {
        let msg = QueueMessage::new("execute", json!({ "jobId": "r1" }));
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire, json!({ "jobRef": "execute", "args": { "jobId": "r1" } }));
        assert_eq!(msg.job_id(), Some("r1"));
    }

    #[test]
    fn missing_args_default_to_null() {
        let msg: QueueMessage = serde_json::from_value(json!({ "jobRef": "noop" })).unwrap();
        assert_eq!(msg.args, Value::Null);
        assert_eq!(msg.job_id(), None);
    }
}
