//! The `NodeHandler` trait: the contract every workflow step must fulfil.

use async_trait::async_trait;

use crate::{NodeError, State};

/// The core node trait.
///
/// A handler receives the traversal's State by mutable reference and augments
/// it in place.  It must tolerate a partially populated State and must not
/// assume any key exists without checking.  Handlers may be re-run by the
/// engine after a `Retryable` error, so side effects must be safe to repeat.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn handle(&self, state: &mut State) -> Result<(), NodeError>;
}

/// Adapter turning a synchronous closure into a [`NodeHandler`].
pub struct FnNode<F> {
    f: F,
}

/// Wrap a synchronous closure as a node.  Useful for cheap routing-adjacent
/// steps (validation, formatting) that never suspend.
pub fn from_fn<F>(f: F) -> FnNode<F>
where
    F: Fn(&mut State) -> Result<(), NodeError> + Send + Sync,
{
    FnNode { f }
}

#[async_trait]
impl<F> NodeHandler for FnNode<F>
where
    F: Fn(&mut State) -> Result<(), NodeError> + Send + Sync,
{
    async fn handle(&self, state: &mut State) -> Result<(), NodeError> {
        (self.f)(state)
    }
}
