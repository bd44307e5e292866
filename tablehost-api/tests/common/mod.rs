//! Common test utilities for the API tests
//!
//! Every test drives its own router in-process over the in-memory store
//! and identity provider, with one seeded administrator.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tablehost_api::app::{build_router, AppState};
use tablehost_api::config::Config;
use tablehost_shared::auth::jwt::{create_token, AdminClaims};
use tablehost_shared::identity::MockIdentityProvider;
use tablehost_shared::provisioning::{Engine, OrchestratorConfig};
use tablehost_shared::store::{AdministratorDirectory, MemoryStore};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test-secret-key-at-least-32-bytes-long";

pub struct TestContext {
    pub app: Router,
    pub store: Arc<MemoryStore>,
    pub identity: Arc<MockIdentityProvider>,
    pub admin_id: Uuid,
    pub jwt_token: String,
}

/// Decoded response
pub struct TestResponse {
    pub status: StatusCode,
    pub request_id: Option<String>,
    pub body: Value,
}

impl TestContext {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(MockIdentityProvider::new());
        let engine = Arc::new(Engine::new(
            store.clone(),
            identity.clone(),
            OrchestratorConfig {
                retry_backoff: std::time::Duration::ZERO,
                ..Default::default()
            },
        ));

        let admin_id = Uuid::new_v4();
        store
            .insert_administrator(admin_id, "ops@tablehost.io", "Platform Ops")
            .await
            .expect("Failed to seed administrator");

        let jwt_token = create_token(&AdminClaims::new(admin_id), JWT_SECRET).expect("Failed to create token");
        let app = build_router(AppState::new(engine, None, Config::local(JWT_SECRET)));

        Self {
            app,
            store,
            identity,
            admin_id,
            jwt_token,
        }
    }

    pub fn auth_header(&self) -> String {
        format!("Bearer {}", self.jwt_token)
    }

    /// Sends an authenticated request
    pub async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> TestResponse {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", self.auth_header());
        self.send_raw(request, body).await
    }

    pub async fn send_raw(&self, request: axum::http::request::Builder, body: Option<Value>) -> TestResponse {
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        TestResponse {
            status,
            request_id,
            body,
        }
    }
}

pub fn provision_body(key: Uuid, slug: &str, email: &str) -> Value {
    json!({
        "idempotencyKey": key,
        "tenant": {
            "name": "Acme Bistro",
            "slug": slug,
            "timezone": "Europe/Berlin",
            "currency": "EUR"
        },
        "owner": { "email": email, "name": "Ada Owner" }
    })
}
