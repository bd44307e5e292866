//! Shared fixtures for the engine integration tests
//!
//! Every test gets its own in-memory store and identity provider, so tests
//! run in parallel without any external services.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tablehost_shared::identity::MockIdentityProvider;
use tablehost_shared::provisioning::{
    Engine, OrchestratorConfig, OwnerInput, ProvisionRequest, ProvisionResponse, RequestContext, TenantInput,
};
use tablehost_shared::store::{AdministratorDirectory, MemoryStore};
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub identity: Arc<MockIdentityProvider>,
    pub engine: Arc<Engine>,
    pub admin_id: Uuid,
}

impl Harness {
    /// Engine over fresh fakes, with one administrator acting as the caller
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(MockIdentityProvider::new());
        let engine = Arc::new(Engine::new(
            store.clone(),
            identity.clone(),
            OrchestratorConfig {
                retry_backoff: Duration::ZERO,
                ..Default::default()
            },
        ));

        let admin_id = Uuid::new_v4();
        store
            .insert_administrator(admin_id, "ops@tablehost.io", "Platform Ops")
            .await
            .expect("Failed to seed administrator");

        Self {
            store,
            identity,
            engine,
            admin_id,
        }
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::new(Uuid::new_v4(), self.admin_id)
    }

    /// Provisions a tenant that must succeed
    pub async fn provisioned(&self, slug: &str, email: &str) -> ProvisionResponse {
        self.engine
            .provision(provision_request(slug, email), self.ctx())
            .await
            .expect("Provisioning should succeed")
    }
}

pub fn provision_request(slug: &str, email: &str) -> ProvisionRequest {
    ProvisionRequest {
        idempotency_key: Uuid::new_v4(),
        tenant: TenantInput {
            name: "Acme Bistro".to_string(),
            slug: slug.to_string(),
            timezone: "Europe/Berlin".to_string(),
            currency: "EUR".to_string(),
        },
        owner: OwnerInput {
            email: email.to_string(),
            name: Some("Ada Owner".to_string()),
        },
    }
}
