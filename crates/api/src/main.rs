//! Ledgerly API Server
//!
//! Hosts the payment-gateway webhook endpoint and the authenticated
//! billing endpoints (purchase, cancel, balance).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgerly_api::routes::create_router;
use ledgerly_api::{ApiConfig, AppState};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
        return;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ledgerly_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ledgerly API Server v{}", env!("CARGO_PKG_VERSION"));

    // Misconfiguration is fatal at startup, not on the first webhook.
    let config = ApiConfig::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to ledger store...");
    let pool = config.billing.create_pool().await?;
    tracing::info!("Ledger store connection established");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Migrations complete");

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, pool);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
