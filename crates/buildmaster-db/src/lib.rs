//! Database layer for buildmaster.
//!
//! Provides repository traits, PostgreSQL implementations, and an in-memory
//! implementation for tests and single-process masters.

pub mod error;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use memory::{BuildsetRecord, MemoryDb};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

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

/// The repositories a master talks to.
#[derive(Clone)]
pub struct Database {
    pub changes: Arc<dyn ChangeRepo>,
    pub buildrequests: Arc<dyn BuildRequestRepo>,
    pub schedulers: Arc<dyn SchedulerRepo>,
}

impl Database {
    /// Repositories backed by PostgreSQL.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            changes: Arc::new(PgChangeRepo::new(pool.clone())),
            buildrequests: Arc::new(PgBuildRequestRepo::new(pool.clone())),
            schedulers: Arc::new(PgSchedulerRepo::new(pool)),
        }
    }

    /// Repositories backed by one shared [`MemoryDb`].
    pub fn in_memory(db: Arc<MemoryDb>) -> Self {
        Self {
            changes: db.clone(),
            buildrequests: db.clone(),
            schedulers: db,
        }
    }
}
