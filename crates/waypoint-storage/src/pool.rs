//! Postgres connection pool bootstrap.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use waypoint_engine::persistence::StoreError;

/// Type alias for the shared pool handed to the `Postgres*Repository` types.
pub type DbPool = PgPool;

/// Create a new connection pool from `database_url`. `max_connections`
/// controls the pool ceiling.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, StoreError> {
    info!(max_connections, "connecting to database");
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))
}

/// Run the embedded migrations under `migrations/` relative to this crate.
pub async fn run_migrations(pool: &DbPool) -> Result<(), StoreError> {
    info!("running waypoint-storage migrations");
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(())
}
