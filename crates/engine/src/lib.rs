//! `engine` crate: graph definition, validation and the traversal engine.
//!
//! A [`Graph`] is built once at process start from [`NodeHandler`]s keyed by
//! an application enum implementing [`NodeId`].  [`WorkflowExecutor`] threads
//! one [`State`] through it per request.  The [`remote`] module provides the
//! nodes that offload work to the `queue` crate and poll for its outcome.
//!
//! [`NodeHandler`]: nodes::NodeHandler
//! [`State`]: nodes::State

pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod graph;
pub mod remote;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
pub use error::{CheckpointError, EngineError};
pub use executor::{ExecutorConfig, TraversalReport, WorkflowExecutor};
pub use graph::{Graph, GraphBuilder, Next, NodeId, Route, Router};
pub use remote::{poll_route, DispatchNode, PollNode, PollPolicy, WaitNode};
