//! Recap API Server
//!
//! Receives payment provider webhooks, verifies and records them, and hands
//! them to the worker through the job queue.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use recap_api::{create_router, security_headers_middleware, AppState, Config};
use recap_billing::{PgBillingStore, PgJobQueue};
use recap_shared::{create_pool, run_migrations, RateLimiter};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,recap_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Recap API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Configuration loaded");

    // Create database pool
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;

    // Rate limiter: Redis when configured, otherwise per-process
    let rate_limiter = match config.redis_url.as_deref() {
        Some(url) => {
            let client = redis::Client::open(url)?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            tracing::info!("Rate limiter using Redis");
            RateLimiter::new_redis(conn)
        }
        None => {
            tracing::info!("Rate limiter using in-memory counters");
            RateLimiter::new_in_memory()
        }
    };

    let store = Arc::new(PgBillingStore::new(pool.clone()));
    let queue = Arc::new(PgJobQueue::new(pool));
    let state = AppState::new(config.clone(), store, queue, rate_limiter)?;

    let app = create_router(state)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
