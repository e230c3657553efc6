//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Queries are built at runtime (`sqlx::query_as`) so the workspace compiles
//! without a live database.

pub mod checkpoints;
pub mod configs;
pub mod jobs;
