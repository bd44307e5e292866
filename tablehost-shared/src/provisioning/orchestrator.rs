//! Provisioning saga
//!
//! ```text
//! initiated -> validating -> creating_tenant_record -> creating_identity
//!           -> linking_identity -> verifying -> completed
//! ```
//!
//! A failure before anything exists ends in `failed`. Once the provisional
//! tenant or an external identity exists, the attempt goes through
//! `rolling_back` and ends in `rolled_back`; an identity that could not be
//! deleted is recorded as `orphaned_identity_id` with
//! `compensation_incomplete` set.
//!
//! The database and the identity provider never share a transaction. The
//! tenant and its owner link are written in transaction #1, the owner
//! profile and activation in transaction #2, and the identity is created in
//! between. Attempts that die mid-flight are finished by
//! [`Engine::reconcile`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

use super::ledger::{fingerprint, Begin};
use super::validator::ConflictSource;
use super::{Engine, RequestContext};
use crate::auth::password::generate_initial_password;
use crate::error::{ErrorBody, ErrorCategory, ErrorCode, ProvisioningError};
use crate::identity::{CreateUser, IdentityClass, IdentityError};
use crate::models::provisioning_request::Completion;
use crate::models::{
    normalize_email, AuditOperation, AuditOutcome, LinkState, NewAuditEntry, NewOwner,
    NewProvisioningRequest, NewTenant, ProvisioningRequest, ProvisioningStatus, Tenant, TenantStatus,
};
use crate::store::{Constraint, ProvisionalTenant, StoreError};

/// Provision request body
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    /// Client-generated key, stable across retries of the same request
    pub idempotency_key: Uuid,

    #[validate(nested)]
    pub tenant: TenantInput,

    #[validate(nested)]
    pub owner: OwnerInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TenantInput {
    #[validate(length(min = 1, max = 200, message = "Tenant name must be 1-200 characters"))]
    pub name: String,

    pub slug: String,

    #[validate(length(min = 1, max = 64, message = "Timezone must be 1-64 characters"))]
    pub timezone: String,

    #[validate(length(equal = 3, message = "Currency must be a 3-letter ISO 4217 code"))]
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OwnerInput {
    #[validate(length(min = 3, max = 254, message = "Email must be 3-254 characters"))]
    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 200, message = "Owner name must be 1-200 characters"))]
    pub name: Option<String>,
}

impl ProvisionRequest {
    /// Payload stored in the ledger and fingerprinted for key reuse checks
    fn canonical_payload(&self) -> serde_json::Value {
        json!({
            "tenant": {
                "name": self.tenant.name.trim(),
                "slug": self.tenant.slug,
                "timezone": self.tenant.timezone,
                "currency": self.tenant.currency.to_uppercase(),
            },
            "owner": {
                "email": normalize_email(&self.owner.email),
                "name": self.owner.name,
            },
        })
    }
}

/// Successful provisioning outcome, replayed verbatim for a retried key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub slug: String,
    pub request_id: Uuid,
}

/// What this attempt knows about the external identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityHandle {
    /// Nothing of ours exists at the provider
    None,
    /// Created by this attempt; deleted on compensation
    Owned(Uuid),
    /// Belongs to someone else; never deleted
    Foreign(Uuid),
    /// A create was sent but its outcome is unknown
    Unresolved,
}

/// What compensation has to undo
#[derive(Debug, Clone, Copy)]
struct CompensationPlan {
    tenant_id: Option<Uuid>,
    owner_profile: Option<Uuid>,
    identity: IdentityHandle,
}

struct Attempt {
    record: ProvisioningRequest,
    tenant_id: Option<Uuid>,
    identity: IdentityHandle,
    linking_started: bool,
    started: Instant,
}

impl Attempt {
    fn plan(&self) -> CompensationPlan {
        let owner_profile = match self.identity {
            IdentityHandle::Owned(id) if self.linking_started => Some(id),
            _ => None,
        };
        CompensationPlan {
            tenant_id: self.tenant_id.or(self.record.tenant_id),
            owner_profile,
            identity: self.identity,
        }
    }

    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Answers a retried key from the stored record
fn replay(existing: &ProvisioningRequest, payload_fingerprint: &str) -> Result<ProvisionResponse, ProvisioningError> {
    if existing.payload_fingerprint != payload_fingerprint {
        return Err(ProvisioningError::DuplicateRequest(
            "idempotency key was already used with a different payload".to_string(),
        ));
    }

    match existing.status {
        ProvisioningStatus::Completed => existing
            .response_payload
            .clone()
            .and_then(|payload| serde_json::from_value(payload).ok())
            .ok_or_else(|| ProvisioningError::Internal("stored provisioning response is unreadable".to_string())),
        ProvisioningStatus::Failed | ProvisioningStatus::RolledBack => {
            Err(ProvisioningError::Replayed(stored_error(existing)))
        }
        _ => Err(ProvisioningError::DuplicateRequest("request in progress".to_string())),
    }
}

/// Error body of a failed record
fn stored_error(record: &ProvisioningRequest) -> ErrorBody {
    if let Some(body) = record
        .response_payload
        .clone()
        .and_then(|payload| serde_json::from_value::<ErrorBody>(payload).ok())
    {
        return body;
    }

    let code = record
        .error_code
        .clone()
        .and_then(|code| serde_json::from_value::<ErrorCode>(serde_json::Value::String(code)).ok())
        .unwrap_or(ErrorCode::InternalError);
    ErrorBody {
        code,
        message: record.error_message.clone().unwrap_or_default(),
        suggestion: None,
        request_id: record.request_id,
    }
}

fn abandoned() -> ProvisioningError {
    ProvisioningError::Internal("attempt abandoned".to_string())
}

impl Engine {
    /// Provisions a tenant and its owner identity
    ///
    /// Runs on the caller's task. Use [`Engine::spawn_provision`] when the
    /// caller may stop waiting.
    pub async fn provision(
        &self,
        request: ProvisionRequest,
        ctx: RequestContext,
    ) -> Result<ProvisionResponse, ProvisioningError> {
        request
            .validate()
            .map_err(|e| ProvisioningError::Validation(e.to_string()))?;

        let payload = request.canonical_payload();
        let new = NewProvisioningRequest {
            request_id: ctx.request_id,
            idempotency_key: request.idempotency_key,
            requester_id: ctx.actor_id,
            tenant_slug: request.tenant.slug.clone(),
            owner_email: normalize_email(&request.owner.email),
            payload_fingerprint: fingerprint(&payload),
            request_payload: payload,
        };

        let record = match self.ledger.begin(&new).await? {
            Begin::New(record) => record,
            Begin::Existing(existing) => {
                info!(
                    idempotency_key = %existing.idempotency_key,
                    status = %existing.status,
                    "Replaying provisioning request"
                );
                return replay(&existing, &new.payload_fingerprint);
            }
        };

        info!(
            request_id = %record.request_id,
            idempotency_key = %record.idempotency_key,
            slug = %record.tenant_slug,
            "Provisioning started"
        );
        self.audit
            .record(self.entry(&record, AuditOperation::Provision, AuditOutcome::Started))
            .await;

        let mut attempt = Attempt {
            record,
            tenant_id: None,
            identity: IdentityHandle::None,
            linking_started: false,
            started: Instant::now(),
        };

        match self.forward(&mut attempt, &request).await {
            Ok(response) => self.finish(attempt, response).await,
            Err(cause) => Err(self.abort(attempt, cause).await),
        }
    }

    /// Runs [`Engine::provision`] on a detached task
    ///
    /// Dropping the handle does not cancel the saga; it still reaches a
    /// terminal state.
    pub fn spawn_provision(
        self: &Arc<Self>,
        request: ProvisionRequest,
        ctx: RequestContext,
    ) -> JoinHandle<Result<ProvisionResponse, ProvisioningError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.provision(request, ctx).await })
    }

    async fn forward(
        &self,
        attempt: &mut Attempt,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, ProvisioningError> {
        let slug = request.tenant.slug.as_str();
        let email = normalize_email(&request.owner.email);

        // validating
        self.step(attempt, ProvisioningStatus::Validating, None, None).await?;
        self.validator.require_slug(slug).await?;
        self.validator.require_email(&email).await?;

        // creating_tenant_record: transaction #1
        self.step(attempt, ProvisioningStatus::CreatingTenantRecord, None, None).await?;
        let provisional = ProvisionalTenant {
            tenant: NewTenant {
                id: Uuid::new_v4(),
                name: request.tenant.name.trim().to_string(),
                slug: slug.to_string(),
                timezone: request.tenant.timezone.clone(),
                currency: request.tenant.currency.to_uppercase(),
            },
            owner_email: email.clone(),
            idempotency_key: attempt.record.idempotency_key,
            request_id: attempt.record.request_id,
        };
        let tenant = match self.store.create_provisional_tenant(&provisional).await {
            Ok(tenant) => tenant,
            Err(e) => return Err(self.tenant_conflict(e, slug, &email).await),
        };
        attempt.tenant_id = Some(tenant.id);

        // creating_identity
        self.step(attempt, ProvisioningStatus::CreatingIdentity, Some(tenant.id), None)
            .await?;
        let identity_id = self.create_identity(attempt, &email).await?;

        if let IdentityClass::Administrator(admin) = self.classifier.classify(identity_id).await? {
            error!(
                request_id = %attempt.record.request_id,
                tenant_id = %tenant.id,
                identity_id = %identity_id,
                admin_email = %admin.email,
                "Identity provider returned an administrator identity for a new owner"
            );
            attempt.identity = IdentityHandle::Foreign(identity_id);
            return Err(ProvisioningError::AdminCredentialProtectionViolation { identity_id });
        }

        // linking_identity: transaction #2
        self.step(attempt, ProvisioningStatus::LinkingIdentity, None, Some(identity_id))
            .await?;
        attempt.linking_started = true;
        let owner = NewOwner {
            id: identity_id,
            email,
            name: request.owner.name.clone(),
        };
        if let Err(e) = self.store.link_owner(tenant.id, &owner).await {
            return Err(self.link_conflict(attempt, e, identity_id));
        }

        // verifying
        self.step(attempt, ProvisioningStatus::Verifying, None, None).await?;
        let tenant = self.verify_linkage(tenant.id, identity_id).await?;

        Ok(ProvisionResponse {
            tenant_id: tenant.id,
            owner_id: identity_id,
            slug: tenant.slug,
            request_id: attempt.record.request_id,
        })
    }

    /// Advances the ledger and audits the new stage
    async fn step(
        &self,
        attempt: &mut Attempt,
        to: ProvisioningStatus,
        tenant_id: Option<Uuid>,
        owner_id: Option<Uuid>,
    ) -> Result<(), ProvisioningError> {
        attempt.record = self.ledger.advance(&attempt.record, to, tenant_id, owner_id).await?;
        self.audit
            .record(
                self.entry(&attempt.record, AuditOperation::Provision, AuditOutcome::Started)
                    .duration_ms(attempt.elapsed_ms()),
            )
            .await;
        Ok(())
    }

    fn entry(&self, record: &ProvisioningRequest, operation: AuditOperation, outcome: AuditOutcome) -> NewAuditEntry {
        NewAuditEntry::new(record.request_id, operation, record.status.as_str(), outcome)
            .idempotency_key(record.idempotency_key)
            .tenant(record.tenant_id)
            .actor(record.requester_id)
    }

    /// Maps a failed transaction #1 to the conflict it represents
    ///
    /// A link-email violation is re-read: a linked row belongs to a live
    /// owner, a provisional one to another attempt still in flight.
    async fn tenant_conflict(&self, err: StoreError, slug: &str, email: &str) -> ProvisioningError {
        match err.constraint() {
            Some(Constraint::Slug) => self.validator.slug_unavailable(slug, "slug is already taken").await,
            Some(Constraint::OwnerEmail) => {
                let source_kind = match self.store.find_link_by_email(email).await {
                    Ok(Some(link)) if link.state == LinkState::Linked => ConflictSource::Owner,
                    Ok(_) => ConflictSource::PendingProvisioning,
                    Err(e) => {
                        warn!(error = %e, "Could not re-read conflicting owner link");
                        ConflictSource::PendingProvisioning
                    }
                };
                ProvisioningError::EmailUnavailable { source_kind }
            }
            Some(Constraint::AdministratorEmail) => ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::Administrator,
            },
            _ => err.into(),
        }
    }

    /// Maps a failed transaction #2
    fn link_conflict(&self, attempt: &mut Attempt, err: StoreError, identity_id: Uuid) -> ProvisioningError {
        match err.constraint() {
            Some(Constraint::AdministratorIdentity) => {
                attempt.identity = IdentityHandle::Foreign(identity_id);
                ProvisioningError::AdminCredentialProtectionViolation { identity_id }
            }
            Some(Constraint::OwnerIdentity) => {
                attempt.identity = IdentityHandle::Foreign(identity_id);
                ProvisioningError::IntegrityVerificationFailed(format!(
                    "identity {} is already linked to another tenant",
                    identity_id
                ))
            }
            Some(Constraint::OwnerEmail) => ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::Owner,
            },
            Some(Constraint::AdministratorEmail) => ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::Administrator,
            },
            _ => err.into(),
        }
    }

    /// Creates the owner identity, retrying provider outages
    async fn create_identity(&self, attempt: &mut Attempt, email: &str) -> Result<Uuid, ProvisioningError> {
        let request = CreateUser {
            email: email.to_string(),
            password: generate_initial_password(),
            request_id: attempt.record.request_id,
        };
        let attempts = self.config.identity_create_attempts.max(1);
        let mut last_error = String::new();

        for n in 1..=attempts {
            attempt.identity = IdentityHandle::Unresolved;
            match self.identity.create_user(&request).await {
                Ok(created) => {
                    attempt.identity = IdentityHandle::Owned(created.id);
                    return Ok(created.id);
                }
                Err(IdentityError::EmailAlreadyExists) => return self.adopt_identity(attempt, email).await,
                Err(IdentityError::ProviderUnavailable(msg)) => {
                    warn!(
                        request_id = %attempt.record.request_id,
                        attempt = n,
                        error = %msg,
                        "Identity creation failed"
                    );
                    last_error = msg;
                    if n < attempts {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ProvisioningError::IdentityProviderUnavailable(last_error))
    }

    /// Handles `EmailAlreadyExists` on create
    ///
    /// The account is used only if this attempt created it (an earlier
    /// create whose response was lost). Any other account is a conflict.
    /// When the lookup cannot find the account the provider just reported,
    /// the handle stays unresolved so compensation looks again.
    async fn adopt_identity(&self, attempt: &mut Attempt, email: &str) -> Result<Uuid, ProvisioningError> {
        let conflict = ProvisioningError::EmailUnavailable {
            source_kind: ConflictSource::IdentityProvider,
        };
        match self.identity.find_user_by_email(email).await? {
            Some(user) if user.request_id == Some(attempt.record.request_id) => {
                info!(
                    request_id = %attempt.record.request_id,
                    identity_id = %user.id,
                    "Adopting identity created by an earlier call of this attempt"
                );
                attempt.identity = IdentityHandle::Owned(user.id);
                Ok(user.id)
            }
            Some(user) => {
                attempt.identity = IdentityHandle::Foreign(user.id);
                Err(conflict)
            }
            None => {
                warn!(
                    request_id = %attempt.record.request_id,
                    "Identity provider reported the email as taken but the lookup found no account"
                );
                attempt.identity = IdentityHandle::Unresolved;
                Err(conflict)
            }
        }
    }

    /// Re-reads tenant, link and owner and checks they agree on the owner
    pub(crate) async fn verify_linkage(&self, tenant_id: Uuid, owner_id: Uuid) -> Result<Tenant, ProvisioningError> {
        let mismatch = |what: String| {
            error!(tenant_id = %tenant_id, owner_id = %owner_id, "Linkage verification failed: {}", what);
            ProvisioningError::IntegrityVerificationFailed(what)
        };

        let tenant = self
            .store
            .find_tenant(tenant_id)
            .await?
            .ok_or_else(|| mismatch("tenant record is missing".to_string()))?;
        if tenant.status != TenantStatus::Active {
            return Err(mismatch(format!("tenant is {} instead of active", tenant.status)));
        }
        if tenant.owner_id != Some(owner_id) {
            return Err(mismatch("tenant owner does not match the created identity".to_string()));
        }

        let link = self
            .store
            .find_link(tenant_id)
            .await?
            .ok_or_else(|| mismatch("owner link is missing".to_string()))?;
        if link.state != LinkState::Linked || link.owner_id != Some(owner_id) {
            return Err(mismatch("owner link does not match the tenant owner".to_string()));
        }

        let owner = self
            .store
            .find_owner(owner_id)
            .await?
            .ok_or_else(|| mismatch("owner profile is missing".to_string()))?;
        if owner.id != owner_id {
            return Err(mismatch("owner profile does not match the tenant owner".to_string()));
        }

        if self.classifier.is_administrator(owner_id).await? {
            error!(tenant_id = %tenant_id, owner_id = %owner_id, "Tenant owner is a platform administrator");
            return Err(ProvisioningError::AdminCredentialProtectionViolation { identity_id: owner_id });
        }

        Ok(tenant)
    }

    async fn finish(
        &self,
        attempt: Attempt,
        response: ProvisionResponse,
    ) -> Result<ProvisionResponse, ProvisioningError> {
        let completion = Completion {
            status: ProvisioningStatus::Completed,
            response_payload: Some(
                serde_json::to_value(&response).map_err(|e| ProvisioningError::Internal(e.to_string()))?,
            ),
            error_code: None,
            error_message: None,
            compensation_incomplete: false,
            orphaned_identity_id: None,
        };

        match self.ledger.complete(&attempt.record, &completion).await {
            Ok(record) => {
                info!(
                    request_id = %record.request_id,
                    tenant_id = %response.tenant_id,
                    owner_id = %response.owner_id,
                    duration_ms = attempt.elapsed_ms(),
                    "Provisioning completed"
                );
                self.audit
                    .record(
                        self.entry(&record, AuditOperation::Provision, AuditOutcome::Succeeded)
                            .duration_ms(attempt.elapsed_ms()),
                    )
                    .await;
                Ok(response)
            }
            Err(e) => {
                // Tenant is live and verified; the reconciler finalizes the record.
                error!(
                    request_id = %attempt.record.request_id,
                    tenant_id = %response.tenant_id,
                    error = %e,
                    "Provisioning verified but not finalized"
                );
                self.audit
                    .record(
                        self.entry(&attempt.record, AuditOperation::Provision, AuditOutcome::Failed)
                            .error(e.code().as_str(), e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Ends an attempt after `cause`: `failed` when nothing exists yet,
    /// compensation otherwise
    async fn abort(&self, mut attempt: Attempt, cause: ProvisioningError) -> ProvisioningError {
        let category = cause.category_at(attempt.record.status);
        if category == ErrorCategory::Invariant {
            error!(
                request_id = %attempt.record.request_id,
                stage = %attempt.record.status,
                category = category.as_str(),
                error = %cause,
                "Provisioning stopped by invariant violation"
            );
        } else {
            warn!(
                request_id = %attempt.record.request_id,
                stage = %attempt.record.status,
                category = category.as_str(),
                error = %cause,
                "Provisioning step failed"
            );
        }

        // Transaction #1 may have committed even though its result was lost.
        if attempt.tenant_id.is_none() && attempt.record.status == ProvisioningStatus::CreatingTenantRecord {
            if let Ok(Some(current)) = self.ledger.find(attempt.record.idempotency_key).await {
                attempt.tenant_id = current.tenant_id;
            }
        }

        let plan = attempt.plan();
        let nothing_created = plan.tenant_id.is_none() && plan.identity == IdentityHandle::None;
        if nothing_created && attempt.record.status.can_transition_to(ProvisioningStatus::Failed) {
            self.fail(&attempt.record, &cause, AuditOperation::Provision).await;
            return cause;
        }

        self.compensate(attempt.record, plan, cause, AuditOperation::Provision)
            .await
    }

    /// Finalizes `record` as `failed`
    async fn fail(&self, record: &ProvisioningRequest, cause: &ProvisioningError, operation: AuditOperation) {
        let body = cause.to_body(record.request_id);
        let completion = Completion {
            status: ProvisioningStatus::Failed,
            response_payload: serde_json::to_value(&body).ok(),
            error_code: Some(body.code.as_str().to_string()),
            error_message: Some(body.message.clone()),
            compensation_incomplete: false,
            orphaned_identity_id: None,
        };

        let record = match self.ledger.complete(record, &completion).await {
            Ok(record) => record,
            Err(e) => {
                error!(request_id = %record.request_id, error = %e, "Could not record failed provisioning");
                record.clone()
            }
        };
        self.audit
            .record(self.entry(&record, operation, AuditOutcome::Failed).error(body.code.as_str(), body.message))
            .await;
    }

    async fn with_retries<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.config.compensation_attempts.max(1);
        let mut n = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if n < attempts => {
                    warn!(attempt = n, error = %e, "Compensation step '{}' failed, retrying", what);
                    tokio::time::sleep(self.config.retry_backoff).await;
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Undoes whatever `plan` lists and finalizes the record as `rolled_back`
    ///
    /// Returns `cause`. If the database records cannot be removed the record
    /// stays in `rolling_back` for the reconciler.
    async fn compensate(
        &self,
        record: ProvisioningRequest,
        plan: CompensationPlan,
        cause: ProvisioningError,
        operation: AuditOperation,
    ) -> ProvisioningError {
        let record = if record.status == ProvisioningStatus::RollingBack {
            record
        } else {
            match self
                .ledger
                .advance(&record, ProvisioningStatus::RollingBack, None, None)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    error!(
                        request_id = %record.request_id,
                        error = %e,
                        "Could not start rollback; leaving attempt to the reconciler"
                    );
                    return cause;
                }
            }
        };
        self.audit.record(self.entry(&record, operation, AuditOutcome::Started)).await;

        if let Some(tenant_id) = plan.tenant_id {
            let removed = self
                .with_retries("remove tenant records", || {
                    self.store
                        .remove_provisioned(tenant_id, record.request_id, plan.owner_profile)
                })
                .await;
            if let Err(e) = removed {
                error!(
                    request_id = %record.request_id,
                    tenant_id = %tenant_id,
                    error = %e,
                    "Could not remove provisional tenant; attempt stays rolling_back"
                );
                self.audit
                    .record(
                        self.entry(&record, operation, AuditOutcome::Failed)
                            .error(ErrorCode::InternalError.as_str(), e.to_string()),
                    )
                    .await;
                return cause;
            }
        }

        let (incomplete, orphan) = self.release_identity(&record, plan.identity).await;

        let body = cause.to_body(record.request_id);
        let completion = Completion {
            status: ProvisioningStatus::RolledBack,
            response_payload: serde_json::to_value(&body).ok(),
            error_code: Some(body.code.as_str().to_string()),
            error_message: Some(body.message.clone()),
            compensation_incomplete: incomplete,
            orphaned_identity_id: orphan,
        };
        let record = match self.ledger.complete(&record, &completion).await {
            Ok(record) => record,
            Err(e) => {
                error!(request_id = %record.request_id, error = %e, "Could not record rollback");
                record
            }
        };

        let outcome = if incomplete {
            error!(
                request_id = %record.request_id,
                orphaned_identity_id = ?orphan,
                "Compensation incomplete: external identity may be orphaned"
            );
            AuditOutcome::CompensationIncomplete
        } else {
            info!(request_id = %record.request_id, "Provisioning rolled back");
            AuditOutcome::Compensated
        };
        self.audit
            .record(
                self.entry(&record, operation, outcome)
                    .error(body.code.as_str(), body.message)
                    .details(json!({ "orphanedIdentityId": orphan })),
            )
            .await;

        cause
    }

    /// Deletes the identity if it is ours; returns (incomplete, orphaned id)
    async fn release_identity(&self, record: &ProvisioningRequest, handle: IdentityHandle) -> (bool, Option<Uuid>) {
        let id = match handle {
            IdentityHandle::None | IdentityHandle::Foreign(_) => return (false, None),
            IdentityHandle::Owned(id) => id,
            IdentityHandle::Unresolved => match self.identity.find_user_by_email(&record.owner_email).await {
                Ok(Some(user)) if user.request_id == Some(record.request_id) => user.id,
                Ok(_) => return (false, None),
                Err(e) => {
                    error!(
                        request_id = %record.request_id,
                        error = %e,
                        "Could not determine whether an identity was created"
                    );
                    return (true, None);
                }
            },
        };

        match self.classifier.is_administrator(id).await {
            Ok(false) => {}
            Ok(true) => {
                error!(identity_id = %id, "Refusing to delete an administrator identity during rollback");
                return (false, None);
            }
            Err(e) => {
                error!(identity_id = %id, error = %e, "Administrator check failed during rollback");
                return (true, Some(id));
            }
        }

        match self.with_retries("delete identity", || self.identity.delete_user(id)).await {
            Ok(()) => (false, None),
            Err(e) => {
                error!(
                    request_id = %record.request_id,
                    orphaned_identity_id = %id,
                    error = %e,
                    "Could not delete identity during rollback"
                );
                (true, Some(id))
            }
        }
    }

    /// Classifies an identity recorded in the ledger by its metadata
    async fn recorded_identity(
        &self,
        record: &ProvisioningRequest,
        id: Uuid,
    ) -> Result<IdentityHandle, ProvisioningError> {
        match self.identity.find_user(id).await? {
            Some(user) if user.request_id == Some(record.request_id) => Ok(IdentityHandle::Owned(id)),
            Some(_) => Ok(IdentityHandle::Foreign(id)),
            None => Ok(IdentityHandle::None),
        }
    }

    /// Drives a stalled attempt to a terminal state
    ///
    /// The record is claimed first; `Ok(None)` means another sweeper owns it.
    /// Otherwise returns the status the record ended in.
    pub async fn reconcile(
        &self,
        record: &ProvisioningRequest,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<ProvisioningStatus>, ProvisioningError> {
        let Some(record) = self.ledger.claim(record, stale_before).await? else {
            return Ok(None);
        };

        info!(
            request_id = %record.request_id,
            idempotency_key = %record.idempotency_key,
            status = %record.status,
            "Reconciling stalled provisioning attempt"
        );
        self.audit
            .record(self.entry(&record, AuditOperation::Reconcile, AuditOutcome::Started))
            .await;

        let key = record.idempotency_key;
        match record.status {
            ProvisioningStatus::Initiated | ProvisioningStatus::Validating => {
                self.fail(&record, &abandoned(), AuditOperation::Reconcile).await;
            }
            ProvisioningStatus::CreatingTenantRecord if record.tenant_id.is_none() => {
                self.fail(&record, &abandoned(), AuditOperation::Reconcile).await;
            }
            ProvisioningStatus::CreatingTenantRecord => {
                let plan = CompensationPlan {
                    tenant_id: record.tenant_id,
                    owner_profile: None,
                    identity: IdentityHandle::None,
                };
                self.compensate(record, plan, abandoned(), AuditOperation::Reconcile)
                    .await;
            }
            ProvisioningStatus::CreatingIdentity => {
                let plan = CompensationPlan {
                    tenant_id: record.tenant_id,
                    owner_profile: None,
                    identity: IdentityHandle::Unresolved,
                };
                self.compensate(record, plan, abandoned(), AuditOperation::Reconcile)
                    .await;
            }
            ProvisioningStatus::LinkingIdentity | ProvisioningStatus::Verifying => {
                self.resume(record).await?;
            }
            ProvisioningStatus::RollingBack => {
                let identity = match record.owner_id {
                    Some(id) => self.recorded_identity(&record, id).await?,
                    None => IdentityHandle::Unresolved,
                };
                let plan = CompensationPlan {
                    tenant_id: record.tenant_id,
                    owner_profile: record.owner_id,
                    identity,
                };
                let cause = ProvisioningError::Replayed(stored_error(&record));
                self.compensate(record, plan, cause, AuditOperation::Reconcile).await;
            }
            ProvisioningStatus::Completed | ProvisioningStatus::Failed | ProvisioningStatus::RolledBack => {}
        }

        Ok(self.ledger.find(key).await?.map(|r| r.status))
    }

    /// Finishes an attempt that got as far as linking
    ///
    /// If transaction #2 committed and the linkage verifies, the attempt is
    /// completed; otherwise it is compensated.
    async fn resume(&self, record: ProvisioningRequest) -> Result<(), ProvisioningError> {
        let (Some(tenant_id), Some(owner_id)) = (record.tenant_id, record.owner_id) else {
            let plan = CompensationPlan {
                tenant_id: record.tenant_id,
                owner_profile: None,
                identity: IdentityHandle::Unresolved,
            };
            self.compensate(record, plan, abandoned(), AuditOperation::Reconcile)
                .await;
            return Ok(());
        };

        match self.verify_linkage(tenant_id, owner_id).await {
            Ok(tenant) => {
                let record = if record.status == ProvisioningStatus::LinkingIdentity {
                    self.ledger
                        .advance(&record, ProvisioningStatus::Verifying, None, None)
                        .await?
                } else {
                    record
                };
                let response = ProvisionResponse {
                    tenant_id,
                    owner_id,
                    slug: tenant.slug,
                    request_id: record.request_id,
                };
                let completion = Completion {
                    status: ProvisioningStatus::Completed,
                    response_payload: Some(
                        serde_json::to_value(&response).map_err(|e| ProvisioningError::Internal(e.to_string()))?,
                    ),
                    error_code: None,
                    error_message: None,
                    compensation_incomplete: false,
                    orphaned_identity_id: None,
                };
                let record = self.ledger.complete(&record, &completion).await?;
                info!(request_id = %record.request_id, tenant_id = %tenant_id, "Stalled provisioning completed");
                self.audit
                    .record(self.entry(&record, AuditOperation::Reconcile, AuditOutcome::Succeeded))
                    .await;
                Ok(())
            }
            Err(e @ ProvisioningError::Internal(_)) => Err(e),
            Err(cause) => {
                let identity = self.recorded_identity(&record, owner_id).await?;
                let owner_profile = match identity {
                    IdentityHandle::Foreign(_) => None,
                    _ => Some(owner_id),
                };
                let plan = CompensationPlan {
                    tenant_id: Some(tenant_id),
                    owner_profile,
                    identity,
                };
                self.compensate(record, plan, cause, AuditOperation::Reconcile).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            idempotency_key: Uuid::new_v4(),
            tenant: TenantInput {
                name: " Acme Bistro ".to_string(),
                slug: "acme-bistro".to_string(),
                timezone: "Europe/Paris".to_string(),
                currency: "eur".to_string(),
            },
            owner: OwnerInput {
                email: "Owner1@Example.com".to_string(),
                name: None,
            },
        }
    }

    fn record(status: ProvisioningStatus, payload_fingerprint: &str) -> ProvisioningRequest {
        let mut record = ProvisioningRequest::initiated(
            NewProvisioningRequest {
                request_id: Uuid::new_v4(),
                idempotency_key: Uuid::new_v4(),
                requester_id: Uuid::new_v4(),
                tenant_slug: "acme-bistro".to_string(),
                owner_email: "owner1@example.com".to_string(),
                payload_fingerprint: payload_fingerprint.to_string(),
                request_payload: json!({}),
            },
            Utc::now(),
        );
        record.status = status;
        record
    }

    #[test]
    fn test_canonical_payload_normalizes() {
        let payload = request().canonical_payload();
        assert_eq!(payload["owner"]["email"], "owner1@example.com");
        assert_eq!(payload["tenant"]["currency"], "EUR");
        assert_eq!(payload["tenant"]["name"], "Acme Bistro");
    }

    #[test]
    fn test_fingerprint_independent_of_key() {
        let a = request();
        let mut b = request();
        b.owner.email = "owner1@example.com".to_string();
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert_eq!(fingerprint(&a.canonical_payload()), fingerprint(&b.canonical_payload()));
    }

    #[test]
    fn test_shape_validation() {
        let mut bad = request();
        bad.tenant.currency = "EURO".to_string();
        assert!(bad.validate().is_err());
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_replay_rejects_different_payload() {
        let existing = record(ProvisioningStatus::Completed, "aaa");
        let err = replay(&existing, "bbb").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRequest);
    }

    #[test]
    fn test_replay_in_progress() {
        let existing = record(ProvisioningStatus::CreatingIdentity, "aaa");
        let err = replay(&existing, "aaa").unwrap_err();
        assert_eq!(err, ProvisioningError::DuplicateRequest("request in progress".to_string()));
    }

    #[test]
    fn test_replay_stored_failure() {
        let mut existing = record(ProvisioningStatus::Failed, "aaa");
        let body = ErrorBody {
            code: ErrorCode::SlugUnavailable,
            message: "taken".to_string(),
            suggestion: Some("acme-bistro-2".to_string()),
            request_id: existing.request_id,
        };
        existing.response_payload = Some(serde_json::to_value(&body).unwrap());

        match replay(&existing, "aaa").unwrap_err() {
            ProvisioningError::Replayed(replayed) => assert_eq!(replayed, body),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    async fn engine_with_owner(email: &str) -> Engine {
        use crate::identity::MockIdentityProvider;
        use crate::store::{AdministratorDirectory, MemoryStore};

        let store = Arc::new(MemoryStore::new());
        let admin_id = Uuid::new_v4();
        store
            .insert_administrator(admin_id, "ops@tablehost.io", "Platform Ops")
            .await
            .unwrap();
        let engine = Engine::new(store, Arc::new(MockIdentityProvider::new()), Default::default());

        let mut request = request();
        request.owner.email = email.to_string();
        engine
            .provision(request, RequestContext::new(Uuid::new_v4(), admin_id))
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_link_email_conflict_names_live_owner() {
        let engine = engine_with_owner("owner1@example.com").await;

        let err = engine
            .tenant_conflict(
                StoreError::unique(crate::store::constraints::LINK_EMAIL),
                "other-bistro",
                "owner1@example.com",
            )
            .await;
        assert_eq!(
            err,
            ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::Owner
            }
        );
    }

    #[tokio::test]
    async fn test_link_email_conflict_without_linked_owner_is_pending() {
        let engine = engine_with_owner("owner1@example.com").await;

        let err = engine
            .tenant_conflict(
                StoreError::unique(crate::store::constraints::LINK_EMAIL),
                "other-bistro",
                "someone-else@example.com",
            )
            .await;
        assert_eq!(
            err,
            ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::PendingProvisioning
            }
        );
    }

    #[test]
    fn test_stored_error_falls_back_to_columns() {
        let mut existing = record(ProvisioningStatus::RolledBack, "aaa");
        existing.error_code = Some("IDENTITY_PROVIDER_UNAVAILABLE".to_string());
        existing.error_message = Some("down".to_string());

        let body = stored_error(&existing);
        assert_eq!(body.code, ErrorCode::IdentityProviderUnavailable);
        assert_eq!(body.message, "down");
    }
}
