//! Node-level error types.

use thiserror::Error;

/// Errors returned by a node's `handle` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: the handler is invoked again with exponential back-off.
/// - `Fatal`: the failure is recorded in the State's error slot at once.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure; the engine may re-run the handler.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

impl NodeError {
    /// The message without the variant prefix, suitable for the error slot.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) => msg,
        }
    }
}

/// Failure to read or write a typed State value.
#[derive(Debug, Error)]
pub enum StateError {
    /// The stored JSON does not match the key's declared type.
    #[error("state key '{key}' holds an incompatible value: {source}")]
    Decode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The value could not be turned into JSON.
    #[error("state key '{key}' could not be encoded: {source}")]
    Encode {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StateError> for NodeError {
    fn from(err: StateError) -> Self {
        NodeError::Fatal(err.to_string())
    }
}
