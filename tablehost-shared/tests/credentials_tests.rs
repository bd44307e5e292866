/// Integration tests for owner credential changes and tenant lifecycle

mod common;

use common::Harness;
use tablehost_shared::error::{ErrorCode, ProvisioningError};
use tablehost_shared::models::{AuditOperation, AuditOutcome, TenantStatus};
use tablehost_shared::provisioning::{ConflictSource, CredentialUpdate, LifecycleAction};
use tablehost_shared::store::{Fault, TenantRepository};
use uuid::Uuid;

fn new_email(email: &str) -> CredentialUpdate {
    CredentialUpdate {
        new_email: Some(email.to_string()),
        new_password: None,
    }
}

fn new_password(password: &str) -> CredentialUpdate {
    CredentialUpdate {
        new_email: None,
        new_password: Some(password.to_string()),
    }
}

#[tokio::test]
async fn test_email_change_updates_provider_profile_and_link() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;

    let response = h
        .engine
        .update_owner_credentials(t.tenant_id, new_email("Door-New@Example.com"), h.ctx())
        .await
        .unwrap();
    assert!(response.updated);
    assert!(!response.owner_created);

    assert_eq!(h.identity.user(t.owner_id).await.unwrap().email, "door-new@example.com");
    assert_eq!(
        h.store.find_owner(t.owner_id).await.unwrap().unwrap().email,
        "door-new@example.com"
    );
    assert_eq!(
        h.store.find_link(t.tenant_id).await.unwrap().unwrap().owner_email,
        "door-new@example.com"
    );

    // The old address is free again
    h.provisioned("red-door", "door@example.com").await;
}

#[tokio::test]
async fn test_password_change() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;

    h.engine
        .update_owner_credentials(t.tenant_id, new_password("Fresh-Password9"), h.ctx())
        .await
        .unwrap();

    assert!(h.identity.password_matches(t.owner_id, "Fresh-Password9").await);
}

#[tokio::test]
async fn test_password_is_never_audited() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;
    let ctx = h.ctx();

    h.engine
        .update_owner_credentials(t.tenant_id, new_password("Fresh-Password9"), ctx)
        .await
        .unwrap();

    let entries = h.engine.audit().list(ctx.request_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, AuditOperation::CredentialUpdate);
    assert_eq!(entries[0].outcome, AuditOutcome::Succeeded);
    assert!(!entries[0].details.to_string().contains("Fresh-Password9"));
}

#[tokio::test]
async fn test_administrator_owner_is_refused_before_provider_call() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;
    h.store.force_tenant_owner(t.tenant_id, h.admin_id).await;
    let calls_before = h.identity.calls().await;
    let ctx = h.ctx();

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, new_password("Takeover-Pass1"), ctx)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ProvisioningError::AdminCredentialProtectionViolation {
            identity_id: h.admin_id
        }
    );
    assert_eq!(h.identity.calls().await, calls_before);

    let entries = h.engine.audit().list(ctx.request_id).await.unwrap();
    assert_eq!(entries[0].outcome, AuditOutcome::Failed);
    assert_eq!(
        entries[0].error_code.as_deref(),
        Some("ADMIN_CREDENTIAL_PROTECTION_VIOLATION")
    );
}

#[tokio::test]
async fn test_email_taken_elsewhere_is_rejected() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;
    h.provisioned("green-door", "green@example.com").await;
    let calls_before = h.identity.calls().await;

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, new_email("green@example.com"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ProvisioningError::EmailUnavailable {
            source_kind: ConflictSource::Owner
        }
    );

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, new_email("ops@tablehost.io"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ProvisioningError::EmailUnavailable {
            source_kind: ConflictSource::Administrator
        }
    );

    assert_eq!(h.identity.calls().await.update, calls_before.update);
    assert_eq!(h.identity.user(t.owner_id).await.unwrap().email, "door@example.com");
}

#[tokio::test]
async fn test_unchanged_email_is_a_no_op() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;

    h.engine
        .update_owner_credentials(t.tenant_id, new_email("DOOR@example.com"), h.ctx())
        .await
        .unwrap();

    assert_eq!(h.identity.calls().await.update, 0);
}

#[tokio::test]
async fn test_missing_owner_profile_is_recreated() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;
    h.store.drop_owner_profile(t.owner_id).await;

    let response = h
        .engine
        .update_owner_credentials(t.tenant_id, new_password("Fresh-Password9"), h.ctx())
        .await
        .unwrap();

    assert!(response.owner_created);
    let owner = h.store.find_owner(t.owner_id).await.unwrap().unwrap();
    assert_eq!(owner.email, "door@example.com");
}

#[tokio::test]
async fn test_mirror_failure_reverts_provider_email() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;
    h.store.inject_fault(Fault::UpdateOwnerEmail, 1).await;

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, new_email("moved@example.com"), h.ctx())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::InternalError);
    assert_eq!(h.identity.user(t.owner_id).await.unwrap().email, "door@example.com");
    assert_eq!(
        h.store.find_owner(t.owner_id).await.unwrap().unwrap().email,
        "door@example.com"
    );
}

#[tokio::test]
async fn test_credential_input_rules() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, CredentialUpdate::default(), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, new_password("short"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, new_email("not-an-email"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);

    let err = h
        .engine
        .update_owner_credentials(Uuid::new_v4(), new_password("Fresh-Password9"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TenantNotFound);
}

#[tokio::test]
async fn test_lifecycle_transitions_keep_owner() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;

    let suspended = h.engine.suspend_tenant(t.tenant_id, h.ctx()).await.unwrap();
    assert_eq!(suspended.status, TenantStatus::Suspended);
    assert_eq!(suspended.owner_id, Some(t.owner_id));

    // Suspended tenants still accept credential changes
    h.engine
        .update_owner_credentials(t.tenant_id, new_password("Fresh-Password9"), h.ctx())
        .await
        .unwrap();

    let active = h.engine.reactivate_tenant(t.tenant_id, h.ctx()).await.unwrap();
    assert_eq!(active.status, TenantStatus::Active);

    let err = h
        .engine
        .change_tenant_status(t.tenant_id, LifecycleAction::Reactivate, h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTenantState);
}

#[tokio::test]
async fn test_archived_tenant_keeps_slug_and_freezes_credentials() {
    let h = Harness::new().await;
    let t = h.provisioned("blue-door", "door@example.com").await;

    let archived = h.engine.archive_tenant(t.tenant_id, h.ctx()).await.unwrap();
    assert_eq!(archived.status, TenantStatus::Archived);
    assert!(archived.archived_at.is_some());
    assert_eq!(archived.owner_id, Some(t.owner_id));

    let err = h
        .engine
        .update_owner_credentials(t.tenant_id, new_password("Fresh-Password9"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTenantState);

    let err = h.engine.reactivate_tenant(t.tenant_id, h.ctx()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTenantState);

    let err = h
        .engine
        .provision(common::provision_request("blue-door", "new-door@example.com"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SlugUnavailable);
    assert_eq!(err.suggestion(), Some("blue-door-2"));
    assert_eq!(h.identity.user_count().await, 1);
}

#[tokio::test]
async fn test_tenant_still_provisioning_rejects_credentials() {
    let h = Harness::new().await;
    h.store.inject_fault(Fault::LinkOwner, 1).await;
    h.store.inject_fault(Fault::RemoveProvisioned, 2).await;
    h.engine
        .provision(common::provision_request("half-built", "half@example.com"), h.ctx())
        .await
        .unwrap_err();

    let tenants = h.store.tenants().await;
    assert_eq!(tenants.len(), 1);
    assert_eq!(tenants[0].status, TenantStatus::Provisioning);
    assert!(tenants[0].owner_id.is_none());

    let err = h
        .engine
        .update_owner_credentials(tenants[0].id, new_password("Fresh-Password9"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidTenantState);
}
