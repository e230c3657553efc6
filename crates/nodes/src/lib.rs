//! `nodes` crate: the request `State`, the `NodeHandler` contract every
//! workflow step implements, and the process-local `ObjectRegistry`.
//!
//! The engine crate drives handlers through this trait object; remote workers
//! and local nodes alike use the registry to keep heavy objects out of State.

pub mod error;
pub mod mock;
pub mod registry;
pub mod state;
pub mod traits;

pub use error::{NodeError, StateError};
pub use registry::{Category, Handle, ObjectRegistry};
pub use state::{ErrorInfo, ErrorKind, State, StateKey};
pub use traits::{from_fn, FnNode, NodeHandler};
