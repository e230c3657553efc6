//! Per-thread State persistence between traversals.

use async_trait::async_trait;
use dashmap::DashMap;
use nodes::State;

use crate::CheckpointError;

/// Stores the final State of a traversal under a conversation/thread id so a
/// later request on the same thread can resume from it.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, thread_id: &str) -> Result<Option<State>, CheckpointError>;

    async fn save(&self, thread_id: &str, state: &State) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    threads: DashMap<String, State>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<State>, CheckpointError> {
        Ok(self.threads.get(thread_id).map(|s| s.value().clone()))
    }

    async fn save(&self, thread_id: &str, state: &State) -> Result<(), CheckpointError> {
        self.threads.insert(thread_id.to_owned(), state.clone());
        Ok(())
    }
}
