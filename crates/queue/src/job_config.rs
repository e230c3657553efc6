//! The configuration payload shared between dispatcher and worker.

use std::collections::BTreeMap;

use cache::{CacheError, ContentSignature, Fingerprint};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::QueueError;

/// Connection types whose locator is a path to a local data file.  Their
/// fingerprint includes the file's content signature.
const FILE_BACKED: &[&str] = &["file", "csv", "sqlite"];

const REQUIRED_FIELDS: &[&str] =
    &["tenant", "connectionType", "selectedResource", "resourceLocator"];

/// Wire contract: `{tenant, connectionType, selectedResource,
/// resourceLocator, behaviorFlags, ...}`.  Unknown fields are preserved in
/// `extra` so job functions can carry their own parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub tenant: String,
    pub connection_type: String,
    pub selected_resource: String,
    pub resource_locator: String,
    #[serde(default)]
    pub behavior_flags: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobConfig {
    /// Parse a broker payload.  A missing or empty required field is an
    /// error naming the field; nothing is defaulted silently.
    pub fn from_payload(payload: &Value) -> Result<Self, QueueError> {
        let object = payload
            .as_object()
            .ok_or_else(|| QueueError::InvalidConfig("payload is not a JSON object".into()))?;

        for field in REQUIRED_FIELDS {
            let problem = match object.get(*field) {
                Some(Value::String(s)) if !s.trim().is_empty() => continue,
                Some(Value::String(_)) => format!("required field '{field}' is empty"),
                Some(Value::Null) | None => format!("missing required field '{field}'"),
                Some(_) => format!("field '{field}' must be a string"),
            };
            return Err(QueueError::InvalidConfig(problem));
        }

        serde_json::from_value(payload.clone())
            .map_err(|e| QueueError::InvalidConfig(e.to_string()))
    }

    pub fn to_payload(&self) -> Result<Value, QueueError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn flag(&self, name: &str) -> Option<&Value> {
        self.behavior_flags.get(name)
    }

    pub fn is_file_backed(&self) -> bool {
        FILE_BACKED.iter().any(|t| t.eq_ignore_ascii_case(&self.connection_type))
    }

    /// Cache key for resources built from this configuration.
    pub fn fingerprint(&self) -> Result<Fingerprint, CacheError> {
        let content = if self.is_file_backed() {
            ContentSignature::of_path(&self.resource_locator)?
        } else {
            ContentSignature::None
        };

        let mut fingerprint = Fingerprint::new(
            &self.tenant,
            &self.selected_resource,
            &self.connection_type,
            &self.resource_locator,
        )
        .with_content(content);
        for (name, value) in &self.behavior_flags {
            fingerprint = fingerprint.with_flag(name, value);
        }
        Ok(fingerprint)
    }
}
