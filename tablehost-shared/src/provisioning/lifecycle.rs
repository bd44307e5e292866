//! Operator lifecycle changes: suspend, reactivate, archive
//!
//! These only move `status` (and `archived_at`); the owner link is never
//! touched. Archived tenants keep their slug.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::{Engine, RequestContext};
use crate::error::ProvisioningError;
use crate::models::{AuditOperation, AuditOutcome, NewAuditEntry, ParseEnumError, Tenant, TenantStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Suspend,
    Reactivate,
    Archive,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Suspend => "suspend",
            LifecycleAction::Reactivate => "reactivate",
            LifecycleAction::Archive => "archive",
        }
    }

    /// Status the tenant ends in
    pub fn target(&self) -> TenantStatus {
        match self {
            LifecycleAction::Suspend => TenantStatus::Suspended,
            LifecycleAction::Reactivate => TenantStatus::Active,
            LifecycleAction::Archive => TenantStatus::Archived,
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suspend" => Ok(LifecycleAction::Suspend),
            "reactivate" => Ok(LifecycleAction::Reactivate),
            "archive" => Ok(LifecycleAction::Archive),
            other => Err(ParseEnumError {
                kind: "lifecycle action",
                value: other.to_string(),
            }),
        }
    }
}

impl Engine {
    pub async fn change_tenant_status(
        &self,
        tenant_id: Uuid,
        action: LifecycleAction,
        ctx: RequestContext,
    ) -> Result<Tenant, ProvisioningError> {
        let result = self.apply_lifecycle(tenant_id, action).await;

        let entry = NewAuditEntry::new(
            ctx.request_id,
            AuditOperation::TenantLifecycle,
            action.as_str(),
            if result.is_ok() {
                AuditOutcome::Succeeded
            } else {
                AuditOutcome::Failed
            },
        )
        .tenant(Some(tenant_id))
        .actor(ctx.actor_id);

        match &result {
            Ok((from, tenant)) => {
                info!(tenant_id = %tenant_id, from = %from, to = %tenant.status, "Tenant status changed");
                self.audit
                    .record(entry.details(json!({ "from": from, "to": tenant.status })))
                    .await;
            }
            Err(e) => {
                self.audit.record(entry.error(e.code().as_str(), e.to_string())).await;
            }
        }

        result.map(|(_, tenant)| tenant)
    }

    async fn apply_lifecycle(
        &self,
        tenant_id: Uuid,
        action: LifecycleAction,
    ) -> Result<(TenantStatus, Tenant), ProvisioningError> {
        let tenant = self
            .store
            .find_tenant(tenant_id)
            .await?
            .ok_or(ProvisioningError::TenantNotFound(tenant_id))?;

        let to = action.target();
        if !tenant.status.can_transition_to(to) {
            return Err(ProvisioningError::InvalidTenantState(format!(
                "cannot {} a tenant that is {}",
                action, tenant.status
            )));
        }

        let updated = self
            .store
            .update_tenant_status(tenant_id, tenant.status, to)
            .await?
            .ok_or_else(|| ProvisioningError::InvalidTenantState("tenant status changed concurrently".to_string()))?;

        Ok((tenant.status, updated))
    }

    pub async fn suspend_tenant(&self, tenant_id: Uuid, ctx: RequestContext) -> Result<Tenant, ProvisioningError> {
        self.change_tenant_status(tenant_id, LifecycleAction::Suspend, ctx).await
    }

    pub async fn reactivate_tenant(&self, tenant_id: Uuid, ctx: RequestContext) -> Result<Tenant, ProvisioningError> {
        self.change_tenant_status(tenant_id, LifecycleAction::Reactivate, ctx).await
    }

    pub async fn archive_tenant(&self, tenant_id: Uuid, ctx: RequestContext) -> Result<Tenant, ProvisioningError> {
        self.change_tenant_status(tenant_id, LifecycleAction::Archive, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_targets() {
        assert_eq!(LifecycleAction::Suspend.target(), TenantStatus::Suspended);
        assert_eq!(LifecycleAction::Reactivate.target(), TenantStatus::Active);
        assert_eq!(LifecycleAction::Archive.target(), TenantStatus::Archived);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("archive".parse::<LifecycleAction>().unwrap(), LifecycleAction::Archive);
        assert!("delete".parse::<LifecycleAction>().is_err());
    }
}
