//! # tender-db
//!
//! PostgreSQL + pgvector persistence for the tender pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for notices, analyses, and query vectors
//! - An in-process [`MemoryDatabase`] implementing the same traits
//!
//! ## Example
//!
//! ```rust,ignore
//! use tender_db::Database;
//!
//! let db = Database::connect("postgres://localhost/tender").await?;
//! db.migrate().await?;
//! let snapshot = db.notices.load_snapshot("0373100000124000001").await?;
//! ```

pub mod analyses;
pub mod memory;
pub mod notices;
pub mod pool;
pub mod query_vectors;

pub use analyses::PgAnalysisRepository;
pub use memory::MemoryDatabase;
pub use notices::PgNoticeRepository;
pub use pool::{create_pool, PoolConfig};
pub use query_vectors::PgQueryVectorRepository;

#[cfg(feature = "migrations")]
use tender_core::Error;
use tender_core::Result;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::PgPool,
    pub notices: PgNoticeRepository,
    pub analyses: PgAnalysisRepository,
    pub query_vectors: PgQueryVectorRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            notices: PgNoticeRepository::new(pool.clone()),
            analyses: PgAnalysisRepository::new(pool.clone()),
            query_vectors: PgQueryVectorRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with the default pool configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }
}
