//! PostgreSQL pool sizing and creation.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use docflow_core::{logging, Error, Result};

/// Connections kept regardless of job concurrency.
pub const BASE_CONNECTIONS: u32 = 4;

/// Connections reserved for progress polling and queue writes.
const RESERVED_CONNECTIONS: u32 = 2;

/// Pool sizing for one docflow process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Also bounds how long startup waits for an unreachable server.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: BASE_CONNECTIONS + RESERVED_CONNECTIONS,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Size the pool for a process running `jobs` pipeline runs at once.
    ///
    /// A run holds one connection at a time (job update or store write).
    pub fn for_workers(jobs: usize) -> Self {
        let jobs = u32::try_from(jobs).unwrap_or(u32::MAX);
        Self {
            max_connections: jobs.max(BASE_CONNECTIONS).saturating_add(RESERVED_CONNECTIONS),
            ..Self::default()
        }
    }

    /// Apply `DOCFLOW_DB_MAX_CONNECTIONS` and `DOCFLOW_DB_ACQUIRE_TIMEOUT_SECS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_u64("DOCFLOW_DB_MAX_CONNECTIONS") {
            self.max_connections = u32::try_from(n).unwrap_or(u32::MAX).max(1);
        }
        if let Some(secs) = env_u64("DOCFLOW_DB_ACQUIRE_TIMEOUT_SECS") {
            self.acquire_timeout = Duration::from_secs(secs);
        }
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Connect with the default sizing.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        duration_ms = logging::millis(start.elapsed()),
        "Database pool ready"
    );
    Ok(pool)
}
