//! Job record store for separation tasks.
//!
//! Exposes the [`TaskStore`] trait the orchestration core depends on, plus
//! two implementations: [`MemoryTaskStore`] for tests and embedded use, and
//! [`PgTaskStore`] backed by PostgreSQL for deployments that must survive
//! process restart.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::MemoryTaskStore;
pub use postgres::PgTaskStore;
pub use store::{StoreError, TaskFilter, TaskStore};

use sqlx::postgres::PgPoolOptions;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Verify the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply embedded migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
