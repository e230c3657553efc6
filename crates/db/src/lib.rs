//! `db` crate: Postgres persistence for the queue, the config broker and
//! traversal checkpoints.
//!
//! Row structs and repository functions are plain SQL.  The `PgTaskBackend`,
//! `PgConfigBroker` and `PgCheckpointStore` adapters plug them into the
//! `queue` and `engine` traits.

pub mod backend;
pub mod broker;
pub mod checkpoint;
pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use backend::PgTaskBackend;
pub use broker::PgConfigBroker;
pub use checkpoint::PgCheckpointStore;
pub use error::DbError;
pub use pool::{create_pool, run_migrations, DbPool, PoolConfig};
