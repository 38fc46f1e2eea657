use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use creditline_api::{create_router, AppState, Config};
use creditline_billing::{BillingServices, PgLedgerStore, RevenueCatClient, RevenueCatConfig};
use creditline_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,sqlx=warn")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let revenuecat = RevenueCatConfig::from_env().context("loading RevenueCat configuration")?;

    if config.run_migrations {
        let migration_pool = db::create_migration_pool(&config.database_url)
            .await
            .context("connecting for migrations")?;
        db::run_migrations(&migration_pool)
            .await
            .context("running migrations")?;
        migration_pool.close().await;
        tracing::info!("Database migrations applied");
    }

    let pool = db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to database")?;

    let store = Arc::new(PgLedgerStore::new(pool.clone()));
    let client = Arc::new(RevenueCatClient::new(revenuecat).context("building RevenueCat client")?);
    let billing = BillingServices::new(store, client);

    if config.revenuecat_webhook_secret.is_none() {
        tracing::warn!(
            "REVENUECAT_WEBHOOK_SECRET is not set; RevenueCat webhooks are accepted without authorization"
        );
    }

    let state = AppState::new(Some(pool), billing, config.revenuecat_webhook_secret.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("binding {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "Creditline API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}
