//! Subledger API server.
//!
//! Hosts the provider webhook endpoint and a health probe. All billing
//! logic lives in `subledger-billing`; this binary is transport only.

use std::sync::Arc;

use subledger_shared::{create_migration_pool, create_pool, run_migrations};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod routes;
mod state;

use crate::config::Config;
use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,subledger_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Subledger API v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Migrations go through the direct URL when one is configured (poolers
    // dislike the prepared statements the migrator uses).
    let migration_url = config
        .database_direct_url
        .as_deref()
        .unwrap_or(&config.database_url);
    let migration_pool = create_migration_pool(migration_url).await?;
    run_migrations(&migration_pool).await?;

    let billing = match subledger_billing::BillingService::from_env(pool.clone()) {
        Ok(billing) => Arc::new(billing),
        Err(e) => {
            anyhow::bail!("Failed to initialize billing service: {e}");
        }
    };

    let state = AppState {
        pool,
        config: config.clone(),
        billing,
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}
