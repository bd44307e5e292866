//! Persistence seams of the engine
//!
//! The engine talks to storage only through the traits below. [`PgStore`]
//! is the production implementation; [`MemoryStore`] mirrors its constraints
//! in memory for tests and local development.
//!
//! Uniqueness is decided by the store, never by the caller: every insert that
//! can race reports the violated constraint through
//! [`StoreError::UniqueViolation`], and [`Constraint::classify`] maps the
//! constraint name back to the conflict it represents.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    provisioning_request::Completion, Administrator, AuditEntry, NewAuditEntry, NewOwner,
    NewProvisioningRequest, NewTenant, Owner, OwnerLink, ProvisioningRequest, ProvisioningStatus,
    Tenant, TenantStatus,
};

pub use memory::{Fault, MemoryStore};
pub use postgres::PgStore;

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique (or uniqueness-like trigger) constraint rejected the write
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// A guarded update found the row in an unexpected state
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Storage could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn unique(constraint: &str) -> Self {
        StoreError::UniqueViolation {
            constraint: constraint.to_string(),
        }
    }

    /// The conflict behind a unique violation, if any
    pub fn constraint(&self) -> Option<Constraint> {
        match self {
            StoreError::UniqueViolation { constraint } => Some(Constraint::classify(constraint)),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

/// Constraint names shared by the migrations and the memory store
pub mod constraints {
    pub const TENANT_SLUG: &str = "tenants_slug_key";
    pub const TENANT_OWNER: &str = "tenants_owner_id_key";
    pub const TENANT_OWNER_ADMIN: &str = "tenants_owner_admin_conflict";
    pub const LINK_EMAIL: &str = "tenant_owner_links_email_key";
    pub const LINK_EMAIL_ADMIN: &str = "tenant_owner_links_email_admin_conflict";
    pub const LINK_OWNER: &str = "tenant_owner_links_owner_id_key";
    pub const LINK_OWNER_ADMIN: &str = "tenant_owner_links_owner_admin_conflict";
    pub const OWNER_ID: &str = "owners_pkey";
    pub const OWNER_EMAIL: &str = "owners_email_key";
    pub const OWNER_EMAIL_ADMIN: &str = "owners_email_admin_conflict";
    pub const OWNER_ID_ADMIN: &str = "owners_id_admin_conflict";
    pub const ADMIN_EMAIL: &str = "administrators_email_key";
    pub const ADMIN_EMAIL_OWNER: &str = "administrators_email_owner_conflict";
    pub const ADMIN_ID_OWNER: &str = "administrators_id_owner_conflict";
    pub const IDEMPOTENCY_KEY: &str = "provisioning_requests_idempotency_key_key";
}

/// What a violated constraint means to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Slug held by another tenant
    Slug,
    /// Email held by another owner or pending link
    OwnerEmail,
    /// Email belongs to an administrator
    AdministratorEmail,
    /// Identity id already linked to a tenant
    OwnerIdentity,
    /// Identity id belongs to an administrator
    AdministratorIdentity,
    IdempotencyKey,
    Other,
}

impl Constraint {
    pub fn classify(name: &str) -> Self {
        use constraints::*;

        match name {
            TENANT_SLUG => Constraint::Slug,
            LINK_EMAIL | OWNER_EMAIL | ADMIN_EMAIL_OWNER => Constraint::OwnerEmail,
            LINK_EMAIL_ADMIN | OWNER_EMAIL_ADMIN | ADMIN_EMAIL => Constraint::AdministratorEmail,
            TENANT_OWNER | LINK_OWNER | OWNER_ID | ADMIN_ID_OWNER => Constraint::OwnerIdentity,
            TENANT_OWNER_ADMIN | LINK_OWNER_ADMIN | OWNER_ID_ADMIN => Constraint::AdministratorIdentity,
            IDEMPOTENCY_KEY => Constraint::IdempotencyKey,
            _ => Constraint::Other,
        }
    }
}

/// Input of the first provisioning transaction
#[derive(Debug, Clone)]
pub struct ProvisionalTenant {
    pub tenant: NewTenant,
    pub owner_email: String,
    pub idempotency_key: Uuid,
    pub request_id: Uuid,
}

/// Tenant, owner and ownership-link persistence
///
/// Each method that touches more than one row runs in a single database
/// transaction.
#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Transaction #1: provisional tenant, provisional link claiming the owner
    /// email, and the ledger's `tenant_id`
    ///
    /// The ledger row must be in `creating_tenant_record`.
    async fn create_provisional_tenant(&self, input: &ProvisionalTenant) -> Result<Tenant, StoreError>;

    /// Transaction #2: owner profile, link owner id, tenant activation
    async fn link_owner(&self, tenant_id: Uuid, owner: &NewOwner) -> Result<Tenant, StoreError>;

    /// Compensation: removes the tenant (and its link) created by `request_id`
    /// and, when given, the owner profile written for it
    async fn remove_provisioned(
        &self,
        tenant_id: Uuid,
        request_id: Uuid,
        owner_id: Option<Uuid>,
    ) -> Result<bool, StoreError>;

    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError>;

    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, StoreError>;

    async fn find_owner(&self, id: Uuid) -> Result<Option<Owner>, StoreError>;

    async fn find_owner_by_email(&self, email: &str) -> Result<Option<Owner>, StoreError>;

    async fn find_link(&self, tenant_id: Uuid) -> Result<Option<OwnerLink>, StoreError>;

    async fn find_link_by_email(&self, email: &str) -> Result<Option<OwnerLink>, StoreError>;

    /// Recreates a missing owner profile mirror
    async fn insert_owner(&self, owner: &NewOwner) -> Result<Owner, StoreError>;

    /// Rewrites the owner email on the profile and the link together
    async fn update_owner_email(&self, tenant_id: Uuid, owner_id: Uuid, email: &str) -> Result<Owner, StoreError>;

    /// Guarded lifecycle change; `None` when the tenant was not in `from`
    async fn update_tenant_status(
        &self,
        id: Uuid,
        from: TenantStatus,
        to: TenantStatus,
    ) -> Result<Option<Tenant>, StoreError>;
}

/// Read-through view of the platform administrators
#[async_trait]
pub trait AdministratorDirectory: Send + Sync {
    async fn find_administrator(&self, id: Uuid) -> Result<Option<Administrator>, StoreError>;

    async fn find_administrator_by_email(&self, email: &str) -> Result<Option<Administrator>, StoreError>;

    async fn insert_administrator(&self, id: Uuid, email: &str, name: &str) -> Result<Administrator, StoreError>;
}

/// Durable rows of the idempotency ledger
#[async_trait]
pub trait ProvisioningLedgerStore: Send + Sync {
    /// Inserts unless the key exists; `None` means another writer owns it
    async fn insert_request_if_absent(
        &self,
        request: &NewProvisioningRequest,
    ) -> Result<Option<ProvisioningRequest>, StoreError>;

    async fn find_request(&self, key: Uuid) -> Result<Option<ProvisioningRequest>, StoreError>;

    async fn advance_request(
        &self,
        key: Uuid,
        from: ProvisioningStatus,
        to: ProvisioningStatus,
        tenant_id: Option<Uuid>,
        owner_id: Option<Uuid>,
    ) -> Result<Option<ProvisioningRequest>, StoreError>;

    async fn complete_request(
        &self,
        key: Uuid,
        from: ProvisioningStatus,
        completion: &Completion,
    ) -> Result<Option<ProvisioningRequest>, StoreError>;

    async fn list_stalled_requests(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProvisioningRequest>, StoreError>;

    async fn claim_stalled_request(
        &self,
        key: Uuid,
        status: ProvisioningStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Option<ProvisioningRequest>, StoreError>;
}

/// Append-only audit sink
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, StoreError>;

    async fn list_audit(&self, request_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Everything the engine needs from storage
pub trait Store: TenantRepository + AdministratorDirectory + ProvisioningLedgerStore + AuditStore {}

impl<T> Store for T where T: TenantRepository + AdministratorDirectory + ProvisioningLedgerStore + AuditStore {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_classification() {
        assert_eq!(Constraint::classify(constraints::TENANT_SLUG), Constraint::Slug);
        assert_eq!(Constraint::classify(constraints::LINK_EMAIL), Constraint::OwnerEmail);
        assert_eq!(
            Constraint::classify(constraints::OWNER_EMAIL_ADMIN),
            Constraint::AdministratorEmail
        );
        assert_eq!(Constraint::classify(constraints::TENANT_OWNER), Constraint::OwnerIdentity);
        assert_eq!(
            Constraint::classify(constraints::OWNER_ID_ADMIN),
            Constraint::AdministratorIdentity
        );
        assert_eq!(Constraint::classify("something_else"), Constraint::Other);
    }

    #[test]
    fn test_store_error_constraint() {
        let err = StoreError::unique(constraints::TENANT_SLUG);
        assert_eq!(err.constraint(), Some(Constraint::Slug));
        assert_eq!(StoreError::NotFound("x".into()).constraint(), None);
    }
}
