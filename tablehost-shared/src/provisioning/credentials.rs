//! Owner credential changes
//!
//! Every change goes through the same sequence, and nothing is written
//! until the first three steps pass:
//!
//! 1. The tenant exists, is not archived and has an owner
//! 2. The owner resolves (a missing local profile is recreated from the
//!    identity provider)
//! 3. The owner is classified as a non-administrator
//! 4. A new email is free everywhere
//! 5. Identity provider update, then the local email mirror, then audit
//!
//! Passwords are never logged or audited.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::validator::ConflictSource;
use super::{Engine, RequestContext};
use crate::auth::password::validate_password_strength;
use crate::error::ProvisioningError;
use crate::identity::{CredentialChange, IdentityError};
use crate::models::{normalize_email, AuditOperation, AuditOutcome, NewAuditEntry, NewOwner, Owner, TenantStatus};
use crate::store::Constraint;

/// Credential update body
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialUpdate {
    #[serde(default)]
    pub new_email: Option<String>,

    #[serde(default)]
    pub new_password: Option<String>,
}

impl fmt::Debug for CredentialUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialUpdate")
            .field("new_email", &self.new_email)
            .field("new_password", &self.new_password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialUpdateResponse {
    pub updated: bool,

    /// The local owner profile was missing and has been recreated
    pub owner_created: bool,

    pub request_id: Uuid,
}

struct Applied {
    owner_id: Uuid,
    owner_created: bool,
    email_changed: bool,
    password_changed: bool,
}

impl Engine {
    /// Changes the email and/or password of a tenant's owner
    pub async fn update_owner_credentials(
        &self,
        tenant_id: Uuid,
        update: CredentialUpdate,
        ctx: RequestContext,
    ) -> Result<CredentialUpdateResponse, ProvisioningError> {
        let started = Instant::now();
        let entry = |outcome| {
            NewAuditEntry::new(ctx.request_id, AuditOperation::CredentialUpdate, "update_credentials", outcome)
                .tenant(Some(tenant_id))
                .actor(ctx.actor_id)
        };

        let result = self.apply_credentials(tenant_id, &update).await;
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(applied) => {
                info!(
                    request_id = %ctx.request_id,
                    tenant_id = %tenant_id,
                    owner_id = %applied.owner_id,
                    email_changed = applied.email_changed,
                    password_changed = applied.password_changed,
                    "Owner credentials updated"
                );
                self.audit
                    .record(entry(AuditOutcome::Succeeded).duration_ms(duration_ms).details(json!({
                        "ownerId": applied.owner_id,
                        "emailChanged": applied.email_changed,
                        "passwordChanged": applied.password_changed,
                        "ownerCreated": applied.owner_created,
                    })))
                    .await;
                Ok(CredentialUpdateResponse {
                    updated: true,
                    owner_created: applied.owner_created,
                    request_id: ctx.request_id,
                })
            }
            Err(e) => {
                if !e.is_invariant_violation() {
                    warn!(request_id = %ctx.request_id, tenant_id = %tenant_id, error = %e, "Credential update rejected");
                }
                self.audit
                    .record(
                        entry(AuditOutcome::Failed)
                            .duration_ms(duration_ms)
                            .error(e.code().as_str(), e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn apply_credentials(&self, tenant_id: Uuid, update: &CredentialUpdate) -> Result<Applied, ProvisioningError> {
        if update.new_email.is_none() && update.new_password.is_none() {
            return Err(ProvisioningError::Validation(
                "at least one of newEmail or newPassword is required".to_string(),
            ));
        }
        if let Some(password) = &update.new_password {
            validate_password_strength(password).map_err(ProvisioningError::Validation)?;
        }

        // (1) tenant
        let tenant = self
            .store
            .find_tenant(tenant_id)
            .await?
            .ok_or(ProvisioningError::TenantNotFound(tenant_id))?;
        match tenant.status {
            TenantStatus::Archived => {
                return Err(ProvisioningError::InvalidTenantState("tenant is archived".to_string()))
            }
            status if status.is_transient() => {
                return Err(ProvisioningError::InvalidTenantState(
                    "tenant is still being provisioned".to_string(),
                ))
            }
            _ => {}
        }
        let owner_id = tenant
            .owner_id
            .ok_or_else(|| ProvisioningError::InvalidTenantState("tenant has no owner".to_string()))?;

        // (2) owner
        let local_owner = self.store.find_owner(owner_id).await?;

        // (3) administrator check, before any provider call
        let target = self.classifier.owner_target(owner_id).await?;

        let (owner, owner_created) = match local_owner {
            Some(owner) => (owner, false),
            None => (self.recreate_owner(owner_id).await?, true),
        };

        // (4) email availability
        let new_email = match &update.new_email {
            Some(email) if normalize_email(email) != normalize_email(&owner.email) => {
                let email = normalize_email(email);
                self.validator.require_email(&email).await?;
                Some(email)
            }
            _ => None,
        };

        let change = CredentialChange {
            email: new_email.clone(),
            password: update.new_password.clone(),
        };
        if change.is_empty() {
            return Ok(Applied {
                owner_id,
                owner_created,
                email_changed: false,
                password_changed: false,
            });
        }

        // (5) provider, then the local mirror
        self.identity
            .update_credentials(&target, &change)
            .await
            .map_err(|e| match e {
                IdentityError::NotFound => ProvisioningError::IntegrityVerificationFailed(format!(
                    "owner identity {} not found at the identity provider",
                    owner_id
                )),
                other => other.into(),
            })?;

        if let Some(email) = &new_email {
            if let Err(e) = self.store.update_owner_email(tenant_id, owner_id, email).await {
                error!(
                    tenant_id = %tenant_id,
                    owner_id = %owner_id,
                    error = %e,
                    "Owner email mirror update failed; reverting identity provider email"
                );
                let revert = CredentialChange {
                    email: Some(owner.email.clone()),
                    password: None,
                };
                if let Err(revert_err) = self.identity.update_credentials(&target, &revert).await {
                    error!(
                        owner_id = %owner_id,
                        error = %revert_err,
                        "Could not revert identity provider email; local mirror is stale"
                    );
                }

                return Err(match e.constraint() {
                    Some(Constraint::OwnerEmail) => ProvisioningError::EmailUnavailable {
                        source_kind: ConflictSource::Owner,
                    },
                    Some(Constraint::AdministratorEmail) => ProvisioningError::EmailUnavailable {
                        source_kind: ConflictSource::Administrator,
                    },
                    _ => e.into(),
                });
            }
        }

        Ok(Applied {
            owner_id,
            owner_created,
            email_changed: new_email.is_some(),
            password_changed: update.new_password.is_some(),
        })
    }

    /// Rebuilds a missing owner profile from the identity provider account
    async fn recreate_owner(&self, owner_id: Uuid) -> Result<Owner, ProvisioningError> {
        let user = self.identity.find_user(owner_id).await?.ok_or_else(|| {
            error!(owner_id = %owner_id, "Tenant owner has neither a profile nor an identity provider account");
            ProvisioningError::IntegrityVerificationFailed(format!(
                "owner identity {} not found at the identity provider",
                owner_id
            ))
        })?;

        let owner = self
            .store
            .insert_owner(&NewOwner {
                id: user.id,
                email: normalize_email(&user.email),
                name: None,
            })
            .await?;
        info!(owner_id = %owner_id, "Recreated missing owner profile");
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let update = CredentialUpdate {
            new_email: Some("new@example.com".to_string()),
            new_password: Some("Secret-Pass1".to_string()),
        };
        let debug = format!("{:?}", update);
        assert!(debug.contains("new@example.com"));
        assert!(!debug.contains("Secret-Pass1"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_update_deserializes_camel_case() {
        let update: CredentialUpdate = serde_json::from_str(r#"{"newEmail":"a@example.com"}"#).unwrap();
        assert_eq!(update.new_email.as_deref(), Some("a@example.com"));
        assert!(update.new_password.is_none());
    }
}
