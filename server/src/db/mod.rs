//! Database Layer
//!
//! Conversation store (`PostgreSQL` or in-memory) and the optional Redis client.

mod memory;
mod models;
mod postgres;
mod store;


use std::time::Duration;

use anyhow::Result;
pub use memory::MemoryConversationStore;
pub use models::*;
pub use postgres::PgConversationStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
pub use store::{ConversationStore, StoreError, StoreResult};
use tracing::info;

/// Create `PostgreSQL` connection pool with health configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(2)
        .max_connections(20)
        // Webhook requests fail fast with a 500 so the platform redelivers
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    info!("Connected to PostgreSQL");
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

/// Create Redis client.
pub async fn create_redis_client(redis_url: &str) -> Result<fred::clients::Client> {
    use fred::prelude::*;

    let config = Config::from_url(redis_url)?;
    let client = Client::new(config, None, None, None);
    client.connect();
    client.wait_for_connect().await?;

    info!("Connected to Redis");
    Ok(client)
}
