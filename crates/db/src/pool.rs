//! Postgres connection pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared Postgres pool used across the whole application.
pub type DbPool = PgPool;

/// `[database]` section of the process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a caller waits for a free connection before failing.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

pub async fn create_pool(database_url: &str, config: &PoolConfig) -> Result<DbPool, DbError> {
    info!(
        url = %redact_url(database_url),
        max_connections = config.max_connections,
        "connecting to database"
    );
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations from `migrations/` at the workspace root.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("applying database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// The URL with any password replaced, for log lines.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_owned();
    };
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_owned();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwords_are_redacted() {
        assert_eq!(
            redact_url("postgres://relay:s3cret@db:5432/relay_flow"),
            "postgres://relay:***@db:5432/relay_flow"
        );
        assert_eq!(redact_url("postgres://relay@db/relay_flow"), "postgres://relay@db/relay_flow");
        assert_eq!(redact_url("postgres://db/relay_flow"), "postgres://db/relay_flow");
    }

    #[test]
    fn pool_section_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{ "max_connections": 4 }"#).unwrap();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.acquire_timeout_ms, 5_000);
    }
}
