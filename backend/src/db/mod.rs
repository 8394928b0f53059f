//! Persistence: connection pool, transactions and repositories.

pub mod memory;
pub mod postgres;
pub mod repository;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;
use crate::error::{AppError, Result};

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repository::Store;
pub use transaction::{batch_with_savepoints, with_transaction, TxContext};

/// Create a new database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Open the store selected by `STORE_BACKEND`, running migrations for Postgres.
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.store_backend.as_str() {
        "memory" => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        "postgres" => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| AppError::Config("DATABASE_URL is required".into()))?;
            let pool = create_pool(url).await?;
            tracing::info!("Connected to database");
            sqlx::migrate!("./migrations").run(&pool).await?;
            tracing::info!("Database migrations complete");
            Ok(Arc::new(PgStore::new(pool)))
        }
        other => Err(AppError::Config(format!("Unknown STORE_BACKEND: {}", other))),
    }
}
