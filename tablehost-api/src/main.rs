//! # Tablehost API Server
//!
//! Serves the provisioning engine over HTTP. Administrators provision
//! tenants with their owner identity, change owner credentials and manage
//! the tenant lifecycle.
//!
//! ## Backends
//!
//! - `DATABASE_URL` set: PostgreSQL (migrations run at startup),
//!   otherwise an in-memory store
//! - `IDENTITY_PROVIDER_URL` set: HTTP identity provider,
//!   otherwise an in-memory one
//!
//! Production mode refuses to start without both.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tablehost-api
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tablehost_api::{
    app::{build_router, AppState},
    config::Config,
};
use tablehost_shared::{
    db::{migrations, pool},
    identity::{HttpIdentityConfig, HttpIdentityProvider, IdentityProvider, MockIdentityProvider},
    provisioning::{Engine, OrchestratorConfig},
    store::{MemoryStore, PgStore, Store},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tablehost_api=debug,tower_http=debug".into());

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

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received, draining connections...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Tablehost API Server v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("Failed to load configuration")?;

    let (store, db): (Arc<dyn Store>, Option<sqlx::PgPool>) = match &config.database.url {
        Some(url) => {
            let db = pool::create_pool(pool::DatabaseConfig {
                url: url.clone(),
                max_connections: config.database.max_connections,
                ..Default::default()
            })
            .await
            .context("Failed to connect to database")?;
            migrations::run_migrations(&db)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Using PostgreSQL store");
            (Arc::new(PgStore::new(db.clone())) as Arc<dyn Store>, Some(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            (Arc::new(MemoryStore::new()) as Arc<dyn Store>, None)
        }
    };

    let identity: Arc<dyn IdentityProvider> = match (&config.identity.url, &config.identity.service_key) {
        (Some(url), Some(key)) => {
            tracing::info!(base_url = %url, "Using HTTP identity provider");
            Arc::new(
                HttpIdentityProvider::new(HttpIdentityConfig {
                    base_url: url.clone(),
                    service_key: key.clone(),
                    timeout: Duration::from_secs(config.identity.timeout_seconds),
                })
                .context("Failed to create identity provider client")?,
            )
        }
        _ => {
            tracing::warn!("IDENTITY_PROVIDER_URL not set, using in-memory identity provider");
            Arc::new(MockIdentityProvider::new())
        }
    };

    let engine = Arc::new(Engine::new(store, identity, OrchestratorConfig::default()));
    let bind_address = config.bind_address();
    let state = AppState::new(engine, db.clone(), config);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!("Server listening on http://{}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(db) = db {
        pool::close_pool(db).await;
    }
    tracing::info!("Server stopped");

    Ok(())
}
