//! # praxis-db
//!
//! PostgreSQL database layer for praxis.
//!
//! This crate provides:
//! - Connection pool management
//! - Embedded schema migrations
//! - Change feed installation and LISTEN primitives
//!
//! The change feed is the interesting part: every tracked table carries an
//! AFTER ROW trigger that publishes a compact JSON notification on a single
//! channel, and [`changefeed`] exposes the channel contract plus helpers to
//! install, verify, and listen on it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use praxis_db::{changefeed, Database};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/praxis").await?;
//!     db.migrate().await?;
//!     changefeed::install(db.pool()).await?;
//!
//!     let mut listener = changefeed::listen(db.pool()).await?;
//!     while let Some(notification) = listener.try_recv().await? {
//!         println!("change: {}", notification.payload());
//!     }
//!     Ok(())
//! }
//! ```

pub mod changefeed;
pub mod pool;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use praxis_core::*;

pub use changefeed::{ChangefeedStatus, CHANGE_CHANNEL, TRIGGER_NAME};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};

/// Database handle wrapping the connection pool.
///
/// Unlike a CRUD service this layer carries no repositories; the real-time
/// core only needs the pool (for migrate/install/verify) and dedicated
/// listener connections built from it.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self { pool }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
