/// Application state and router builder
///
/// This module defines the shared application state and provides
/// a function to build the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tablehost_api::{app::AppState, config::Config};
/// use tablehost_shared::identity::MockIdentityProvider;
/// use tablehost_shared::provisioning::{Engine, OrchestratorConfig};
/// use tablehost_shared::store::MemoryStore;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// let engine = Engine::new(
///     Arc::new(MemoryStore::new()),
///     Arc::new(MockIdentityProvider::new()),
///     OrchestratorConfig::default(),
/// );
/// let state = AppState::new(Arc::new(engine), None, config);
/// let app = tablehost_api::app::build_router(state);
/// # Ok(())
/// # }
/// ```

use crate::{
    config::Config,
    middleware::{
        admin_auth::admin_auth_layer,
        request_id::{request_id_layer, REQUEST_ID_HEADER},
        security::SecurityHeadersLayer,
    },
};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use tablehost_shared::provisioning::Engine;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Shared application state
///
/// This is cloned for each request handler via Axum's `State` extractor.
/// Uses Arc internally for cheap cloning.
#[derive(Clone)]
pub struct AppState {
    /// Provisioning engine
    pub engine: Arc<Engine>,

    /// Database pool, when running on PostgreSQL (health checks)
    pub db: Option<PgPool>,

    /// Application configuration
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, db: Option<PgPool>, config: Config) -> Self {
        Self {
            engine,
            db,
            config: Arc::new(config),
        }
    }

    /// Gets JWT secret for token operations
    pub fn jwt_secret(&self) -> &str {
        &self.config.jwt.secret
    }
}

/// Builds the complete Axum router with all routes and middleware
///
/// # Architecture
///
/// ```text
/// /
/// ├── /health                                   # Health check (public)
/// └── /v1/                                      # Administrator JWT required
///     ├── POST /tenants/provision
///     ├── PUT  /tenants/:id/owner/credentials
///     ├── POST /tenants/:id/suspend
///     ├── POST /tenants/:id/reactivate
///     ├── POST /tenants/:id/archive
///     ├── GET  /availability/slug?slug=
///     ├── GET  /availability/email?email=
///     ├── GET  /provisioning-requests/:key
///     └── GET  /provisioning-requests/:key/audit
/// ```
///
/// # Middleware Stack
///
/// Applied in order (outermost first):
/// 1. Security headers
/// 2. CORS (tower-http CorsLayer)
/// 3. Request id (`x-request-id`)
/// 4. Logging (tower-http TraceLayer)
/// 5. Administrator authentication (`/v1` only)
pub fn build_router(state: AppState) -> Router {
    use crate::routes;

    let health_routes = Router::new().route("/health", get(routes::health::health_check));

    let tenant_routes = Router::new()
        .route("/provision", post(routes::tenants::provision))
        .route("/:tenant_id/owner/credentials", put(routes::tenants::update_credentials))
        .route("/:tenant_id/suspend", post(routes::tenants::suspend))
        .route("/:tenant_id/reactivate", post(routes::tenants::reactivate))
        .route("/:tenant_id/archive", post(routes::tenants::archive));

    let availability_routes = Router::new()
        .route("/slug", get(routes::availability::check_slug))
        .route("/email", get(routes::availability::check_email));

    let request_routes = Router::new()
        .route("/:idempotency_key", get(routes::provisioning_requests::get_request))
        .route("/:idempotency_key/audit", get(routes::provisioning_requests::get_audit));

    let v1_routes = Router::new()
        .nest("/tenants", tenant_routes)
        .nest("/availability", availability_routes)
        .nest("/provisioning-requests", request_routes)
        .layer(axum::middleware::from_fn_with_state(state.clone(), admin_auth_layer));

    // Configure CORS based on environment
    let cors = if state.config.api.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                REQUEST_ID_HEADER,
            ])
            .expose_headers([REQUEST_ID_HEADER])
            .max_age(std::time::Duration::from_secs(3600))
    };

    Router::new()
        .merge(health_routes)
        .nest("/v1", v1_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(axum::middleware::from_fn(request_id_layer))
        .layer(cors)
        .layer(SecurityHeadersLayer::new(state.config.api.production))
        .with_state(state)
}
