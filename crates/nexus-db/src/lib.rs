//! Persistence layer for the Nexus workflow platform.
//!
//! Provides repository traits with PostgreSQL implementations, the
//! lease-based task queue, and the filesystem blob store backend.

pub mod blob;
pub mod error;
pub mod queue;
pub mod repo;

pub use blob::FsBlobStore;
pub use error::{DbError, DbResult};
pub use queue::{QueueMessage, TaskQueue, WorkQueue};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
