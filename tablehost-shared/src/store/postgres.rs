//! PostgreSQL implementation of the store traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::{
    AdministratorDirectory, AuditStore, ProvisionalTenant, ProvisioningLedgerStore, StoreError,
    TenantRepository,
};
use crate::models::{
    provisioning_request::Completion, Administrator, AuditEntry, NewAuditEntry, NewOwner,
    NewProvisioningRequest, Owner, OwnerLink, ProvisioningRequest, ProvisioningStatus, Tenant,
    TenantStatus,
};

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TenantRepository for PgStore {
    async fn create_provisional_tenant(&self, input: &ProvisionalTenant) -> Result<Tenant, StoreError> {
        let mut tx = self.pool.begin().await?;

        let tenant = Tenant::insert_provisional(&mut *tx, &input.tenant).await?;
        OwnerLink::insert_provisional(&mut *tx, tenant.id, &input.owner_email, input.request_id).await?;

        let recorded = ProvisioningRequest::advance(
            &mut *tx,
            input.idempotency_key,
            ProvisioningStatus::CreatingTenantRecord,
            ProvisioningStatus::CreatingTenantRecord,
            Some(tenant.id),
            None,
        )
        .await?;

        if recorded.is_none() {
            // Dropping the transaction rolls back the tenant and link.
            return Err(StoreError::Conflict(format!(
                "provisioning request {} left creating_tenant_record",
                input.idempotency_key
            )));
        }

        tx.commit().await?;

        debug!(tenant_id = %tenant.id, slug = %tenant.slug, "Provisional tenant committed");
        Ok(tenant)
    }

    async fn link_owner(&self, tenant_id: Uuid, owner: &NewOwner) -> Result<Tenant, StoreError> {
        let mut tx = self.pool.begin().await?;

        Owner::insert(&mut *tx, owner).await?;

        if OwnerLink::mark_linked(&mut *tx, tenant_id, owner.id).await?.is_none() {
            return Err(StoreError::Conflict(format!("tenant {} has no provisional link", tenant_id)));
        }

        let tenant = Tenant::activate_with_owner(&mut *tx, tenant_id, owner.id)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("tenant {} is not provisioning", tenant_id)))?;

        tx.commit().await?;

        debug!(tenant_id = %tenant_id, owner_id = %owner.id, "Owner linked");
        Ok(tenant)
    }

    async fn remove_provisioned(
        &self,
        tenant_id: Uuid,
        request_id: Uuid,
        owner_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let removed = Tenant::delete_created_by(&mut *tx, tenant_id, request_id).await?;
        if let Some(owner_id) = owner_id {
            Owner::delete_unreferenced(&mut *tx, owner_id).await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        Ok(Tenant::find_by_id(&self.pool, id).await?)
    }

    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(Tenant::find_by_slug(&self.pool, slug).await?)
    }

    async fn find_owner(&self, id: Uuid) -> Result<Option<Owner>, StoreError> {
        Ok(Owner::find_by_id(&self.pool, id).await?)
    }

    async fn find_owner_by_email(&self, email: &str) -> Result<Option<Owner>, StoreError> {
        Ok(Owner::find_by_email(&self.pool, email).await?)
    }

    async fn find_link(&self, tenant_id: Uuid) -> Result<Option<OwnerLink>, StoreError> {
        Ok(OwnerLink::find_by_tenant(&self.pool, tenant_id).await?)
    }

    async fn find_link_by_email(&self, email: &str) -> Result<Option<OwnerLink>, StoreError> {
        Ok(OwnerLink::find_by_email(&self.pool, email).await?)
    }

    async fn insert_owner(&self, owner: &NewOwner) -> Result<Owner, StoreError> {
        Ok(Owner::insert(&self.pool, owner).await?)
    }

    async fn update_owner_email(&self, tenant_id: Uuid, owner_id: Uuid, email: &str) -> Result<Owner, StoreError> {
        let mut tx = self.pool.begin().await?;

        let owner = Owner::update_email(&mut *tx, owner_id, email)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("owner {}", owner_id)))?;

        OwnerLink::update_email(&mut *tx, tenant_id, email)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("owner link of tenant {}", tenant_id)))?;

        tx.commit().await?;
        Ok(owner)
    }

    async fn update_tenant_status(
        &self,
        id: Uuid,
        from: TenantStatus,
        to: TenantStatus,
    ) -> Result<Option<Tenant>, StoreError> {
        Ok(Tenant::update_status(&self.pool, id, from, to).await?)
    }
}

#[async_trait]
impl AdministratorDirectory for PgStore {
    async fn find_administrator(&self, id: Uuid) -> Result<Option<Administrator>, StoreError> {
        Ok(Administrator::find_by_id(&self.pool, id).await?)
    }

    async fn find_administrator_by_email(&self, email: &str) -> Result<Option<Administrator>, StoreError> {
        Ok(Administrator::find_by_email(&self.pool, email).await?)
    }

    async fn insert_administrator(&self, id: Uuid, email: &str, name: &str) -> Result<Administrator, StoreError> {
        Ok(Administrator::insert(&self.pool, id, email, name).await?)
    }
}

#[async_trait]
impl ProvisioningLedgerStore for PgStore {
    async fn insert_request_if_absent(
        &self,
        request: &NewProvisioningRequest,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        Ok(ProvisioningRequest::insert_if_absent(&self.pool, request).await?)
    }

    async fn find_request(&self, key: Uuid) -> Result<Option<ProvisioningRequest>, StoreError> {
        Ok(ProvisioningRequest::find_by_key(&self.pool, key).await?)
    }

    async fn advance_request(
        &self,
        key: Uuid,
        from: ProvisioningStatus,
        to: ProvisioningStatus,
        tenant_id: Option<Uuid>,
        owner_id: Option<Uuid>,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        Ok(ProvisioningRequest::advance(&self.pool, key, from, to, tenant_id, owner_id).await?)
    }

    async fn complete_request(
        &self,
        key: Uuid,
        from: ProvisioningStatus,
        completion: &Completion,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        Ok(ProvisioningRequest::complete(&self.pool, key, from, completion).await?)
    }

    async fn list_stalled_requests(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProvisioningRequest>, StoreError> {
        Ok(ProvisioningRequest::list_stalled(&self.pool, older_than, limit).await?)
    }

    async fn claim_stalled_request(
        &self,
        key: Uuid,
        status: ProvisioningStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        Ok(ProvisioningRequest::claim_stalled(&self.pool, key, status, older_than).await?)
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, StoreError> {
        Ok(AuditEntry::insert(&self.pool, entry).await?)
    }

    async fn list_audit(&self, request_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(AuditEntry::list_by_request(&self.pool, request_id).await?)
    }
}
