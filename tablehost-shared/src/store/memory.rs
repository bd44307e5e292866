//! In-memory store
//!
//! Enforces the same uniqueness rules as the database schema (reporting the
//! same constraint names) so the engine behaves identically against it. Used
//! by the test suites and for running the API without PostgreSQL.
//!
//! Faults can be injected per operation to exercise compensation paths.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    constraints, AdministratorDirectory, AuditStore, ProvisionalTenant, ProvisioningLedgerStore,
    StoreError, TenantRepository,
};
use crate::models::{
    normalize_email, provisioning_request::Completion, Administrator, AuditEntry, LinkState,
    NewAuditEntry, NewOwner, NewProvisioningRequest, Owner, OwnerLink, ProvisioningRequest,
    ProvisioningStatus, Tenant, TenantStatus,
};

/// Operations that can be made to fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    CreateProvisionalTenant,
    /// The linking transaction fails as a whole
    LinkOwner,
    /// The linking transaction commits a link pointing at a foreign owner id
    CorruptLink,
    RemoveProvisioned,
    UpdateOwnerEmail,
    AdvanceRequest,
    CompleteRequest,
    AppendAudit,
}

#[derive(Debug, Default)]
struct State {
    tenants: HashMap<Uuid, Tenant>,
    owners: HashMap<Uuid, Owner>,
    links: HashMap<Uuid, OwnerLink>,
    administrators: HashMap<Uuid, Administrator>,
    requests: HashMap<Uuid, ProvisioningRequest>,
    audit: Vec<AuditEntry>,
    faults: HashMap<Fault, u32>,
}

impl State {
    fn trip(&mut self, fault: Fault) -> bool {
        match self.faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn check_fault(&mut self, fault: Fault) -> Result<(), StoreError> {
        if self.trip(fault) {
            return Err(StoreError::Unavailable(format!("injected fault: {:?}", fault)));
        }
        Ok(())
    }

    fn admin_has_email(&self, email: &str) -> bool {
        let email = normalize_email(email);
        self.administrators.values().any(|a| normalize_email(&a.email) == email)
    }

    fn owner_with_email(&self, email: &str) -> Option<&Owner> {
        let email = normalize_email(email);
        self.owners.values().find(|o| normalize_email(&o.email) == email)
    }

    fn link_with_email(&self, email: &str) -> Option<&OwnerLink> {
        let email = normalize_email(email);
        self.links.values().find(|l| normalize_email(&l.owner_email) == email)
    }

    /// Mirrors the `owners` unique index and admin guard trigger
    fn check_new_owner(&self, owner: &NewOwner) -> Result<(), StoreError> {
        if self.administrators.contains_key(&owner.id) {
            return Err(StoreError::unique(constraints::OWNER_ID_ADMIN));
        }
        if self.admin_has_email(&owner.email) {
            return Err(StoreError::unique(constraints::OWNER_EMAIL_ADMIN));
        }
        if self.owners.contains_key(&owner.id) {
            return Err(StoreError::unique(constraints::OWNER_ID));
        }
        if self.owner_with_email(&owner.email).is_some() {
            return Err(StoreError::unique(constraints::OWNER_EMAIL));
        }
        Ok(())
    }
}

/// Store kept entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` calls of an operation fail
    pub async fn inject_fault(&self, fault: Fault, times: u32) {
        self.state.lock().await.faults.insert(fault, times);
    }

    /// Points a tenant at an arbitrary identity, bypassing every constraint
    ///
    /// Exists to build fixtures that the real schema would reject.
    pub async fn force_tenant_owner(&self, tenant_id: Uuid, owner_id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(tenant) = state.tenants.get_mut(&tenant_id) {
            tenant.owner_id = Some(owner_id);
        }
        if let Some(link) = state.links.get_mut(&tenant_id) {
            link.owner_id = Some(owner_id);
        }
    }

    /// Removes an owner profile without touching the tenant
    pub async fn drop_owner_profile(&self, owner_id: Uuid) {
        self.state.lock().await.owners.remove(&owner_id);
    }

    /// Pretends a request was last touched `age` ago
    pub async fn backdate_request(&self, key: Uuid, age: Duration) {
        let mut state = self.state.lock().await;
        if let Some(request) = state.requests.get_mut(&key) {
            request.updated_at = Utc::now() - age;
        }
    }

    pub async fn tenants(&self) -> Vec<Tenant> {
        self.state.lock().await.tenants.values().cloned().collect()
    }

    pub async fn owners(&self) -> Vec<Owner> {
        self.state.lock().await.owners.values().cloned().collect()
    }

    pub async fn links(&self) -> Vec<OwnerLink> {
        self.state.lock().await.links.values().cloned().collect()
    }

    pub async fn requests(&self) -> Vec<ProvisioningRequest> {
        self.state.lock().await.requests.values().cloned().collect()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }
}

#[async_trait]
impl TenantRepository for MemoryStore {
    async fn create_provisional_tenant(&self, input: &ProvisionalTenant) -> Result<Tenant, StoreError> {
        let mut state = self.state.lock().await;
        state.check_fault(Fault::CreateProvisionalTenant)?;

        let data = &input.tenant;
        if state.tenants.contains_key(&data.id) {
            return Err(StoreError::unique("tenants_pkey"));
        }
        if state
            .tenants
            .values()
            .any(|t| t.slug == data.slug)
        {
            return Err(StoreError::unique(constraints::TENANT_SLUG));
        }
        if state.admin_has_email(&input.owner_email) {
            return Err(StoreError::unique(constraints::LINK_EMAIL_ADMIN));
        }
        if state.link_with_email(&input.owner_email).is_some() {
            return Err(StoreError::unique(constraints::LINK_EMAIL));
        }
        match state.requests.get(&input.idempotency_key) {
            Some(request) if request.status == ProvisioningStatus::CreatingTenantRecord => {}
            _ => {
                return Err(StoreError::Conflict(format!(
                    "provisioning request {} left creating_tenant_record",
                    input.idempotency_key
                )))
            }
        }

        let now = Utc::now();
        let tenant = Tenant::provisional(data.clone(), now);
        let link = OwnerLink::provisional(tenant.id, input.owner_email.clone(), input.request_id, now);

        state.tenants.insert(tenant.id, tenant.clone());
        state.links.insert(tenant.id, link);
        if let Some(request) = state.requests.get_mut(&input.idempotency_key) {
            request.tenant_id = Some(tenant.id);
            request.updated_at = now;
        }

        Ok(tenant)
    }

    async fn link_owner(&self, tenant_id: Uuid, owner: &NewOwner) -> Result<Tenant, StoreError> {
        let mut state = self.state.lock().await;
        state.check_fault(Fault::LinkOwner)?;
        let corrupt = state.trip(Fault::CorruptLink);

        state.check_new_owner(owner)?;

        match state.links.get(&tenant_id) {
            Some(link) if link.state == LinkState::Provisional => {}
            _ => return Err(StoreError::Conflict(format!("tenant {} has no provisional link", tenant_id))),
        }
        if state
            .links
            .values()
            .any(|l| l.tenant_id != tenant_id && l.owner_id == Some(owner.id))
        {
            return Err(StoreError::unique(constraints::LINK_OWNER));
        }
        match state.tenants.get(&tenant_id) {
            Some(tenant) if tenant.status == TenantStatus::Provisioning => {}
            _ => return Err(StoreError::Conflict(format!("tenant {} is not provisioning", tenant_id))),
        }
        if state
            .tenants
            .values()
            .any(|t| t.id != tenant_id && t.owner_id == Some(owner.id))
        {
            return Err(StoreError::unique(constraints::TENANT_OWNER));
        }

        let now = Utc::now();
        state.owners.insert(owner.id, Owner::from_new(owner.clone(), now));

        if let Some(link) = state.links.get_mut(&tenant_id) {
            link.owner_id = Some(if corrupt { Uuid::new_v4() } else { owner.id });
            link.state = LinkState::Linked;
            link.updated_at = now;
        }

        let tenant = state
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("tenant {}", tenant_id)))?;
        tenant.owner_id = Some(owner.id);
        tenant.status = TenantStatus::Active;
        tenant.updated_at = now;

        Ok(tenant.clone())
    }

    async fn remove_provisioned(
        &self,
        tenant_id: Uuid,
        request_id: Uuid,
        owner_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_fault(Fault::RemoveProvisioned)?;

        let created_by_request = state
            .links
            .get(&tenant_id)
            .map(|l| l.request_id == request_id)
            .unwrap_or(false);
        let removable = state
            .tenants
            .get(&tenant_id)
            .map(|t| matches!(t.status, TenantStatus::Provisioning | TenantStatus::Active))
            .unwrap_or(false);

        let removed = created_by_request && removable;
        if removed {
            state.tenants.remove(&tenant_id);
            state.links.remove(&tenant_id);
        }

        if let Some(owner_id) = owner_id {
            if !state.tenants.values().any(|t| t.owner_id == Some(owner_id)) {
                state.owners.remove(&owner_id);
            }
        }

        Ok(removed)
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        Ok(self.state.lock().await.tenants.get(&id).cloned())
    }

    async fn find_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .tenants
            .values()
            .find(|t| t.slug == slug)
            .cloned())
    }

    async fn find_owner(&self, id: Uuid) -> Result<Option<Owner>, StoreError> {
        Ok(self.state.lock().await.owners.get(&id).cloned())
    }

    async fn find_owner_by_email(&self, email: &str) -> Result<Option<Owner>, StoreError> {
        Ok(self.state.lock().await.owner_with_email(email).cloned())
    }

    async fn find_link(&self, tenant_id: Uuid) -> Result<Option<OwnerLink>, StoreError> {
        Ok(self.state.lock().await.links.get(&tenant_id).cloned())
    }

    async fn find_link_by_email(&self, email: &str) -> Result<Option<OwnerLink>, StoreError> {
        Ok(self.state.lock().await.link_with_email(email).cloned())
    }

    async fn insert_owner(&self, owner: &NewOwner) -> Result<Owner, StoreError> {
        let mut state = self.state.lock().await;
        state.check_new_owner(owner)?;

        let record = Owner::from_new(owner.clone(), Utc::now());
        state.owners.insert(owner.id, record.clone());
        Ok(record)
    }

    async fn update_owner_email(&self, tenant_id: Uuid, owner_id: Uuid, email: &str) -> Result<Owner, StoreError> {
        let mut state = self.state.lock().await;
        state.check_fault(Fault::UpdateOwnerEmail)?;

        if !state.owners.contains_key(&owner_id) {
            return Err(StoreError::NotFound(format!("owner {}", owner_id)));
        }
        if !state.links.contains_key(&tenant_id) {
            return Err(StoreError::NotFound(format!("owner link of tenant {}", tenant_id)));
        }
        if state.admin_has_email(email) {
            return Err(StoreError::unique(constraints::OWNER_EMAIL_ADMIN));
        }
        if state.owner_with_email(email).map(|o| o.id != owner_id).unwrap_or(false) {
            return Err(StoreError::unique(constraints::OWNER_EMAIL));
        }
        if state
            .link_with_email(email)
            .map(|l| l.tenant_id != tenant_id)
            .unwrap_or(false)
        {
            return Err(StoreError::unique(constraints::LINK_EMAIL));
        }

        let now = Utc::now();
        if let Some(link) = state.links.get_mut(&tenant_id) {
            link.owner_email = email.to_string();
            link.updated_at = now;
        }
        let owner = state
            .owners
            .get_mut(&owner_id)
            .ok_or_else(|| StoreError::NotFound(format!("owner {}", owner_id)))?;
        owner.email = email.to_string();
        owner.updated_at = now;

        Ok(owner.clone())
    }

    async fn update_tenant_status(
        &self,
        id: Uuid,
        from: TenantStatus,
        to: TenantStatus,
    ) -> Result<Option<Tenant>, StoreError> {
        let mut state = self.state.lock().await;

        let tenant = match state.tenants.get_mut(&id) {
            Some(tenant) if tenant.status == from => tenant,
            _ => return Ok(None),
        };

        let now = Utc::now();
        tenant.status = to;
        tenant.updated_at = now;
        if to == TenantStatus::Archived {
            tenant.archived_at = Some(now);
        }

        Ok(Some(tenant.clone()))
    }
}

#[async_trait]
impl AdministratorDirectory for MemoryStore {
    async fn find_administrator(&self, id: Uuid) -> Result<Option<Administrator>, StoreError> {
        Ok(self.state.lock().await.administrators.get(&id).cloned())
    }

    async fn find_administrator_by_email(&self, email: &str) -> Result<Option<Administrator>, StoreError> {
        let email = normalize_email(email);
        Ok(self
            .state
            .lock()
            .await
            .administrators
            .values()
            .find(|a| normalize_email(&a.email) == email)
            .cloned())
    }

    async fn insert_administrator(&self, id: Uuid, email: &str, name: &str) -> Result<Administrator, StoreError> {
        let mut state = self.state.lock().await;

        if state.owners.contains_key(&id) {
            return Err(StoreError::unique(constraints::ADMIN_ID_OWNER));
        }
        if state.admin_has_email(email) {
            return Err(StoreError::unique(constraints::ADMIN_EMAIL));
        }
        if state.owner_with_email(email).is_some() || state.link_with_email(email).is_some() {
            return Err(StoreError::unique(constraints::ADMIN_EMAIL_OWNER));
        }
        if state.administrators.contains_key(&id) {
            return Err(StoreError::unique("administrators_pkey"));
        }

        let admin = Administrator {
            id,
            email: normalize_email(email),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.administrators.insert(id, admin.clone());
        Ok(admin)
    }
}

#[async_trait]
impl ProvisioningLedgerStore for MemoryStore {
    async fn insert_request_if_absent(
        &self,
        request: &NewProvisioningRequest,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        let mut state = self.state.lock().await;

        if state.requests.contains_key(&request.idempotency_key) {
            return Ok(None);
        }

        let record = ProvisioningRequest::initiated(request.clone(), Utc::now());
        state.requests.insert(request.idempotency_key, record.clone());
        Ok(Some(record))
    }

    async fn find_request(&self, key: Uuid) -> Result<Option<ProvisioningRequest>, StoreError> {
        Ok(self.state.lock().await.requests.get(&key).cloned())
    }

    async fn advance_request(
        &self,
        key: Uuid,
        from: ProvisioningStatus,
        to: ProvisioningStatus,
        tenant_id: Option<Uuid>,
        owner_id: Option<Uuid>,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        let mut state = self.state.lock().await;
        state.check_fault(Fault::AdvanceRequest)?;

        let request = match state.requests.get_mut(&key) {
            Some(request) if request.status == from => request,
            _ => return Ok(None),
        };

        request.status = to;
        if tenant_id.is_some() {
            request.tenant_id = tenant_id;
        }
        if owner_id.is_some() {
            request.owner_id = owner_id;
        }
        request.updated_at = Utc::now();

        Ok(Some(request.clone()))
    }

    async fn complete_request(
        &self,
        key: Uuid,
        from: ProvisioningStatus,
        completion: &Completion,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        let mut state = self.state.lock().await;
        state.check_fault(Fault::CompleteRequest)?;

        let request = match state.requests.get_mut(&key) {
            Some(request) if request.status == from => request,
            _ => return Ok(None),
        };

        let now = Utc::now();
        request.status = completion.status;
        request.response_payload = completion.response_payload.clone();
        request.error_code = completion.error_code.clone();
        request.error_message = completion.error_message.clone();
        request.compensation_incomplete = completion.compensation_incomplete;
        request.orphaned_identity_id = completion.orphaned_identity_id;
        request.updated_at = now;
        request.completed_at = Some(now);

        Ok(Some(request.clone()))
    }

    async fn list_stalled_requests(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProvisioningRequest>, StoreError> {
        let state = self.state.lock().await;

        let mut stalled: Vec<ProvisioningRequest> = state
            .requests
            .values()
            .filter(|r| !r.status.is_terminal() && r.updated_at < older_than)
            .cloned()
            .collect();
        stalled.sort_by_key(|r| r.updated_at);
        stalled.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(stalled)
    }

    async fn claim_stalled_request(
        &self,
        key: Uuid,
        status: ProvisioningStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Option<ProvisioningRequest>, StoreError> {
        let mut state = self.state.lock().await;

        match state.requests.get_mut(&key) {
            Some(request) if request.status == status && request.updated_at < older_than => {
                request.updated_at = Utc::now();
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<AuditEntry, StoreError> {
        let mut state = self.state.lock().await;
        state.check_fault(Fault::AppendAudit)?;

        let record = AuditEntry::from_new(Uuid::new_v4(), entry.clone(), Utc::now());
        state.audit.push(record.clone());
        Ok(record)
    }

    async fn list_audit(&self, request_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect())
    }
}
