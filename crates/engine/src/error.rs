//! Engine-level error types.
//!
//! Traversal failures never surface here: they are recorded in the State's
//! error slot.  `EngineError` only covers graph construction, which aborts
//! startup.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    /// `set_entry` was never called.
    #[error("graph has no entry node")]
    MissingEntry,

    /// The entry node was never added.
    #[error("entry node '{0}' is not registered")]
    UnknownEntry(String),

    /// Two nodes share the same id.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// A node was given more than one outgoing edge.
    #[error("node '{0}' already has an outgoing edge")]
    DuplicateEdge(String),

    /// An edge references a node that was never added.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Every node needs exactly one outgoing edge, even if it is `End`.
    #[error("node '{0}' has no outgoing edge")]
    MissingEdge(String),
}

/// Failure of a [`CheckpointStore`](crate::CheckpointStore).  Logged by the
/// executor, never propagated to callers of `invoke`.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint backend error: {0}")]
    Backend(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
