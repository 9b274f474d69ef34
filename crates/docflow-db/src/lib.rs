//! # docflow-db
//!
//! PostgreSQL persistence for docflow.
//!
//! This crate provides:
//! - Connection pool management
//! - `PgJobRepository`: job and batch records with a `content_hash` index for
//!   dedup lookups
//! - `PgTaskQueue`: lease-based durable queue for the distributed scheduler
//! - `PgDocumentStore`: the Store stage collaborator
//!
//! ## Example
//!
//! ```rust,ignore
//! use docflow_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> docflow_core::Result<()> {
//!     let db = Database::connect("postgres://localhost/docflow").await?;
//!     db.migrate().await?;
//!     let batch = db.jobs.get_batch(batch_id).await?;
//!     Ok(())
//! }
//! ```

pub mod documents;
pub mod jobs;
pub mod pool;
pub mod queue;

pub use documents::PgDocumentStore;
pub use jobs::PgJobRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use queue::PgTaskQueue;

#[cfg(feature = "migrations")]
use docflow_core::Error;
use docflow_core::Result;

/// The PostgreSQL collaborators of one docflow process, sharing a pool.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub jobs: PgJobRepository,
    pub queue: PgTaskQueue,
    pub documents: PgDocumentStore,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            queue: PgTaskQueue::new(pool.clone()),
            documents: PgDocumentStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(create_pool(url).await?))
    }

    /// Connect with a pool sized by [`PoolConfig::for_workers`].
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        Ok(Self::new(create_pool_with_config(url, config).await?))
    }

    /// Apply the bundled schema migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))
    }
}
