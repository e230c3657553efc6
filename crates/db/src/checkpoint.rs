//! `CheckpointStore` over the `checkpoints` table.

use async_trait::async_trait;
use engine::{CheckpointError, CheckpointStore};
use nodes::State;

use crate::{repository::checkpoints, DbPool};

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: DbPool,
}

impl PgCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<State>, CheckpointError> {
        match checkpoints::load_checkpoint(&self.pool, thread_id).await? {
            Some(row) => Ok(Some(serde_json::from_value(row.state)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, thread_id: &str, state: &State) -> Result<(), CheckpointError> {
        checkpoints::save_checkpoint(&self.pool, thread_id, serde_json::to_value(state)?).await?;
        Ok(())
    }
}
