//! Tenant provisioning and credential lifecycle engine
//!
//! [`Engine`] bundles the collaborators every operation needs:
//!
//! - [`ledger`]: idempotency ledger and state machine enforcement
//! - [`validator`]: advisory slug/email availability checks
//! - [`audit`]: append-only trace of every stage
//! - [`orchestrator`]: the provisioning saga and its compensation
//! - [`credentials`]: owner email/password changes
//! - [`lifecycle`]: suspend, reactivate and archive
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tablehost_shared::identity::MockIdentityProvider;
//! use tablehost_shared::provisioning::{Engine, OrchestratorConfig};
//! use tablehost_shared::store::MemoryStore;
//!
//! let engine = Engine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MockIdentityProvider::new()),
//!     OrchestratorConfig::default(),
//! );
//! ```

pub mod audit;
pub mod credentials;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::identity::{DirectoryClassifier, IdentityClassifier, IdentityProvider};
use crate::store::Store;

pub use audit::AuditLog;
pub use credentials::{CredentialUpdate, CredentialUpdateResponse};
pub use ledger::{fingerprint, Begin, Ledger};
pub use lifecycle::LifecycleAction;
pub use orchestrator::{OwnerInput, ProvisionRequest, ProvisionResponse, TenantInput};
pub use validator::{AvailabilityValidator, ConflictSource, EmailCheck, SlugCheck};

/// Tunables of the provisioning saga
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Identity creation attempts in total before compensating
    pub identity_create_attempts: u32,

    /// Attempts of each compensation step (the first plus retries)
    pub compensation_attempts: u32,

    /// Number of `<slug>-N` candidates tried for a suggestion
    pub suggestion_attempts: usize,

    /// Pause between retries
    pub retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            identity_create_attempts: 2,
            compensation_attempts: 2,
            suggestion_attempts: 10,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Who asked, and under which correlation id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// Correlation id echoed in responses and audit entries
    pub request_id: Uuid,

    /// Administrator performing the operation
    pub actor_id: Uuid,
}

impl RequestContext {
    pub fn new(request_id: Uuid, actor_id: Uuid) -> Self {
        Self { request_id, actor_id }
    }
}

/// The provisioning engine
pub struct Engine {
    store: Arc<dyn Store>,
    identity: Arc<dyn IdentityProvider>,
    classifier: Arc<dyn IdentityClassifier>,
    validator: AvailabilityValidator,
    ledger: Ledger,
    audit: AuditLog,
    config: OrchestratorConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, identity: Arc<dyn IdentityProvider>, config: OrchestratorConfig) -> Self {
        let classifier: Arc<dyn IdentityClassifier> = Arc::new(DirectoryClassifier::new(store.clone()));

        Self {
            validator: AvailabilityValidator::new(store.clone(), identity.clone(), config.suggestion_attempts),
            ledger: Ledger::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            store,
            identity,
            classifier,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn classifier(&self) -> &Arc<dyn IdentityClassifier> {
        &self.classifier
    }

    pub fn validator(&self) -> &AvailabilityValidator {
        &self.validator
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}
