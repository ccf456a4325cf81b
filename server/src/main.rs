//! Helpdesk Server - Main Entry Point

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use helpdesk_server::{
    api::{self, Backends},
    auth::PgSessionResolver,
    config, db,
    relay::GraphMessenger,
    webhooks::{self, EventDeduplicator, PgEventDeduplicator, RedisEventDeduplicator},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helpdesk_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    let config = config::Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Helpdesk Server"
    );

    // Initialize database
    let db_pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&db_pool).await?;

    // Processed-event records live in Redis when configured, Postgres otherwise
    let dedup: Arc<dyn EventDeduplicator> = match &config.redis_url {
        Some(redis_url) => {
            let redis = db::create_redis_client(redis_url).await?;
            info!("Webhook deduplication backed by Redis");
            Arc::new(RedisEventDeduplicator::new(
                redis,
                config.dedup_retention_days,
            ))
        }
        None => Arc::new(PgEventDeduplicator::new(db_pool.clone())),
    };
    webhooks::spawn_retention_task(dedup.clone(), config.dedup_retention_days);

    let messenger = GraphMessenger::new(
        &config.graph_api_url,
        config.page_access_token.clone(),
        config.relay_attempt_timeout,
    )?;

    // Build application state
    let state = api::AppState::new(
        config.clone(),
        Backends {
            store: Arc::new(db::PgConversationStore::new(db_pool.clone())),
            dedup,
            sessions: Arc::new(PgSessionResolver::new(db_pool)),
            messenger: Arc::new(messenger),
        },
    );

    if let Err(e) = state.relay.recover_unfinished().await {
        warn!(error = %e, "Failed to recover unfinished replies");
    }

    // Build router
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "Server listening");

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutdown complete");

    Ok(())
}
