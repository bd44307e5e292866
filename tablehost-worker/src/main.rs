//! # Tablehost Worker
//!
//! Sweeps the provisioning ledger for attempts whose process died
//! mid-saga and drives them to a terminal state: completed when the owner
//! link committed, otherwise failed or rolled back with the external
//! identity deleted.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tablehost-worker
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tablehost_shared::{
    db::pool,
    identity::{HttpIdentityConfig, HttpIdentityProvider},
    provisioning::{Engine, OrchestratorConfig},
    store::PgStore,
};
use tablehost_worker::{config::WorkerConfig, reconciler::Reconciler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tablehost_worker=debug".into());

    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Tablehost Worker v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    let db = pool::create_pool(pool::DatabaseConfig {
        url: config.database_url.clone(),
        max_connections: config.database_max_connections,
        min_connections: 1,
        ..Default::default()
    })
    .await
    .context("Failed to connect to database")?;

    let identity = HttpIdentityProvider::new(HttpIdentityConfig {
        base_url: config.identity_provider_url.clone(),
        service_key: config.identity_provider_service_key.clone(),
        timeout: Duration::from_secs(config.identity_provider_timeout_secs),
    })
    .context("Failed to create identity provider client")?;

    let engine = Arc::new(Engine::new(
        Arc::new(PgStore::new(db.clone())),
        Arc::new(identity),
        OrchestratorConfig::default(),
    ));

    let reconciler = Reconciler::new(engine, config.reconciler());
    let token = reconciler.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received, finishing current sweep...");
        token.cancel();
    });

    reconciler.run().await?;

    pool::close_pool(db).await;
    tracing::info!("Worker stopped");

    Ok(())
}
