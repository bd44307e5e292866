/// Integration tests for the provisioning saga
///
/// Run against the in-memory store and identity provider; no services needed.

mod common;

use common::{provision_request, Harness};
use tablehost_shared::error::{ErrorCode, ProvisioningError};
use tablehost_shared::models::{AuditOutcome, LinkState, ProvisioningStatus, TenantStatus};
use tablehost_shared::provisioning::{ConflictSource, CredentialUpdate};
use tablehost_shared::store::{Fault, TenantRepository};
use uuid::Uuid;

async fn request_status(h: &Harness, key: Uuid) -> ProvisioningStatus {
    h.engine
        .ledger()
        .find(key)
        .await
        .unwrap()
        .expect("ledger record should exist")
        .status
}

#[tokio::test]
async fn test_acme_bistro_walkthrough() {
    let h = Harness::new().await;

    // Provision T1 / O1
    let first = h.provisioned("acme-bistro", "owner1@example.com").await;
    assert_eq!(first.slug, "acme-bistro");

    let tenant = h.store.find_tenant(first.tenant_id).await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Active);
    assert_eq!(tenant.owner_id, Some(first.owner_id));

    // Same slug under a new key
    let err = h
        .engine
        .provision(provision_request("acme-bistro", "someone@example.com"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SlugUnavailable);
    assert_eq!(err.suggestion(), Some("acme-bistro-2"));

    // Suggested slug, but the owner email is already used
    let err = h
        .engine
        .provision(provision_request("acme-bistro-2", "owner1@example.com"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ProvisioningError::EmailUnavailable {
            source_kind: ConflictSource::Owner
        }
    );
    assert_eq!(h.store.tenants().await.len(), 1);

    // Move O1 to a new email
    h.engine
        .update_owner_credentials(
            first.tenant_id,
            CredentialUpdate {
                new_email: Some("owner1-new@example.com".to_string()),
                new_password: None,
            },
            h.ctx(),
        )
        .await
        .unwrap();

    let user = h.identity.user(first.owner_id).await.unwrap();
    assert_eq!(user.email, "owner1-new@example.com");

    let after = h.store.find_tenant(first.tenant_id).await.unwrap().unwrap();
    assert_eq!(after.owner_id, tenant.owner_id);
    assert_eq!(after.slug, tenant.slug);
    assert_eq!(after.status, tenant.status);
}

#[tokio::test]
async fn test_successful_provision_records_everything() {
    let h = Harness::new().await;
    let request = provision_request("trattoria-roma", "Chef@Example.com");
    let key = request.idempotency_key;
    let ctx = h.ctx();

    let response = h.engine.provision(request, ctx).await.unwrap();
    assert_eq!(response.request_id, ctx.request_id);

    let owner = h.store.find_owner(response.owner_id).await.unwrap().unwrap();
    assert_eq!(owner.email, "chef@example.com");

    let link = h.store.find_link(response.tenant_id).await.unwrap().unwrap();
    assert_eq!(link.state, LinkState::Linked);
    assert_eq!(link.owner_id, Some(response.owner_id));

    let record = h.engine.ledger().find(key).await.unwrap().unwrap();
    assert_eq!(record.status, ProvisioningStatus::Completed);
    assert_eq!(record.tenant_id, Some(response.tenant_id));
    assert_eq!(record.owner_id, Some(response.owner_id));
    assert!(record.completed_at.is_some());

    let stages: Vec<String> = h
        .engine
        .audit()
        .list(ctx.request_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.stage)
        .collect();
    for stage in ["validating", "creating_tenant_record", "creating_identity", "linking_identity", "verifying"] {
        assert!(stages.iter().any(|s| s == stage), "missing audit stage {}", stage);
    }
}

#[tokio::test]
async fn test_replay_returns_identical_response() {
    let h = Harness::new().await;
    let request = provision_request("golden-fork", "fork@example.com");

    let first = h.engine.provision(request.clone(), h.ctx()).await.unwrap();
    let second = h.engine.provision(request, h.ctx()).await.unwrap();

    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
    assert_eq!(h.store.tenants().await.len(), 1);
    assert_eq!(h.identity.user_count().await, 1);
    assert_eq!(h.identity.calls().await.create, 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_payload_is_rejected() {
    let h = Harness::new().await;
    let request = provision_request("golden-fork", "fork@example.com");
    h.engine.provision(request.clone(), h.ctx()).await.unwrap();

    let mut changed = request;
    changed.tenant.name = "Silver Spoon".to_string();
    let err = h.engine.provision(changed, h.ctx()).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::DuplicateRequest);
    assert_eq!(h.store.tenants().await.len(), 1);
}

#[tokio::test]
async fn test_failed_request_replays_original_error() {
    let h = Harness::new().await;
    h.provisioned("acme-bistro", "owner1@example.com").await;

    let request = provision_request("acme-bistro", "owner2@example.com");
    let first_ctx = h.ctx();
    let first = h.engine.provision(request.clone(), first_ctx).await.unwrap_err();
    assert_eq!(first.code(), ErrorCode::SlugUnavailable);

    let replayed = h.engine.provision(request.clone(), h.ctx()).await.unwrap_err();
    match replayed {
        ProvisioningError::Replayed(body) => {
            assert_eq!(body.code, ErrorCode::SlugUnavailable);
            assert_eq!(body.suggestion.as_deref(), Some("acme-bistro-2"));
            assert_eq!(body.request_id, first_ctx.request_id);
        }
        other => panic!("expected a replayed error, got {:?}", other),
    }
    assert_eq!(request_status(&h, request.idempotency_key).await, ProvisioningStatus::Failed);
}

#[tokio::test]
async fn test_malformed_input_is_rejected_before_the_ledger() {
    let h = Harness::new().await;
    let mut request = provision_request("acme-bistro", "owner1@example.com");
    request.tenant.currency = "EURO".to_string();

    let err = h.engine.provision(request, h.ctx()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);
    assert!(h.store.requests().await.is_empty());
}

#[tokio::test]
async fn test_bad_and_reserved_slugs() {
    let h = Harness::new().await;

    let bad = provision_request("Acme Bistro!", "owner1@example.com");
    let err = h.engine.provision(bad.clone(), h.ctx()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);
    assert_eq!(request_status(&h, bad.idempotency_key).await, ProvisioningStatus::Failed);

    let err = h
        .engine
        .provision(provision_request("admin", "owner1@example.com"), h.ctx())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SlugUnavailable);

    assert!(h.store.tenants().await.is_empty());
    assert_eq!(h.identity.calls().await.create, 0);
}

#[tokio::test]
async fn test_administrator_email_is_never_reused() {
    let h = Harness::new().await;

    let err = h
        .engine
        .provision(provision_request("ops-kitchen", "OPS@tablehost.io"), h.ctx())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ProvisioningError::EmailUnavailable {
            source_kind: ConflictSource::Administrator
        }
    );
    assert!(h.store.tenants().await.is_empty());
    assert_eq!(h.identity.calls().await.mutations(), 0);
}

#[tokio::test]
async fn test_existing_provider_account_is_never_adopted() {
    let h = Harness::new().await;
    let stranger = Uuid::new_v4();
    h.identity
        .insert_user(stranger, "diner@example.com", "Stranger-Pass1")
        .await
        .unwrap();

    let err = h
        .engine
        .provision(provision_request("diner-place", "diner@example.com"), h.ctx())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ProvisioningError::EmailUnavailable {
            source_kind: ConflictSource::IdentityProvider
        }
    );
    assert!(h.identity.user(stranger).await.is_some());
    assert!(h.store.tenants().await.is_empty());
    assert!(h.store.owners().await.is_empty());
}

#[tokio::test]
async fn test_provider_down_fails_without_side_effects() {
    let h = Harness::new().await;
    h.identity.set_available(false).await;

    let request = provision_request("quiet-cafe", "quiet@example.com");
    let err = h.engine.provision(request.clone(), h.ctx()).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::IdentityProviderUnavailable);
    assert!(h.store.tenants().await.is_empty());
    assert_eq!(request_status(&h, request.idempotency_key).await, ProvisioningStatus::Failed);
}

#[tokio::test]
async fn test_identity_creation_is_retried_once() {
    let h = Harness::new().await;
    h.identity.fail_next_creates(1).await;

    let response = h.provisioned("second-try", "retry@example.com").await;

    assert_eq!(h.identity.calls().await.create, 2);
    assert!(h.identity.user(response.owner_id).await.is_some());
}

#[tokio::test]
async fn test_persistent_provider_failure_rolls_back_tenant() {
    let h = Harness::new().await;
    h.identity.fail_next_creates(2).await;

    let request = provision_request("never-opens", "never@example.com");
    let err = h.engine.provision(request.clone(), h.ctx()).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::IdentityProviderUnavailable);
    assert!(h.store.tenants().await.is_empty());
    assert!(h.store.links().await.is_empty());
    assert_eq!(h.identity.user_count().await, 0);

    let record = h.engine.ledger().find(request.idempotency_key).await.unwrap().unwrap();
    assert_eq!(record.status, ProvisioningStatus::RolledBack);
    assert!(!record.compensation_incomplete);

    // The slug is free again
    h.provisioned("never-opens", "other@example.com").await;
}

#[tokio::test]
async fn test_lost_create_response_adopts_own_identity() {
    let h = Harness::new().await;
    h.identity.lose_next_create_responses(1).await;

    let response = h.provisioned("lost-and-found", "lost@example.com").await;

    assert_eq!(h.identity.user_count().await, 1);
    let user = h.identity.user(response.owner_id).await.unwrap();
    assert_eq!(user.email, "lost@example.com");
}

#[tokio::test]
async fn test_lost_create_with_stale_lookup_is_cleaned_up() {
    let h = Harness::new().await;
    h.identity.lose_next_create_responses(1).await;
    h.identity.miss_next_email_lookups(1).await;

    let request = provision_request("stale-listing", "stale@example.com");
    let err = h.engine.provision(request.clone(), h.ctx()).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::EmailUnavailable);
    assert!(h.store.tenants().await.is_empty());
    assert_eq!(h.identity.user_count().await, 0);

    let record = h.engine.ledger().find(request.idempotency_key).await.unwrap().unwrap();
    assert_eq!(record.status, ProvisioningStatus::RolledBack);
    assert!(!record.compensation_incomplete);
}

#[tokio::test]
async fn test_link_failure_compensates_everything() {
    let h = Harness::new().await;
    h.store.inject_fault(Fault::LinkOwner, 1).await;

    let request = provision_request("half-baked", "half@example.com");
    let ctx = h.ctx();
    let err = h.engine.provision(request.clone(), ctx).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::InternalError);
    assert!(h.store.tenants().await.is_empty());
    assert!(h.store.links().await.is_empty());
    assert!(h.store.owners().await.is_empty());
    assert_eq!(h.identity.user_count().await, 0);

    let record = h.engine.ledger().find(request.idempotency_key).await.unwrap().unwrap();
    assert_eq!(record.status, ProvisioningStatus::RolledBack);
    assert!(!record.compensation_incomplete);
    assert!(record.orphaned_identity_id.is_none());

    let audit = h.engine.audit().list(ctx.request_id).await.unwrap();
    assert!(audit.iter().any(|e| e.outcome == AuditOutcome::Compensated));
}

#[tokio::test]
async fn test_undeletable_identity_is_recorded_as_orphan() {
    let h = Harness::new().await;
    h.store.inject_fault(Fault::LinkOwner, 1).await;
    h.identity.fail_next_deletes(2).await;

    let request = provision_request("stuck-kitchen", "stuck@example.com");
    let ctx = h.ctx();
    h.engine.provision(request.clone(), ctx).await.unwrap_err();

    let record = h.engine.ledger().find(request.idempotency_key).await.unwrap().unwrap();
    assert_eq!(record.status, ProvisioningStatus::RolledBack);
    assert!(record.compensation_incomplete);
    let orphan = record.orphaned_identity_id.expect("orphan should be recorded");
    assert!(h.identity.user(orphan).await.is_some());
    assert!(h.store.tenants().await.is_empty());

    let audit = h.engine.audit().list(ctx.request_id).await.unwrap();
    let entry = audit
        .iter()
        .find(|e| e.outcome == AuditOutcome::CompensationIncomplete)
        .expect("compensation_incomplete audit entry");
    assert_eq!(entry.details["orphanedIdentityId"], orphan.to_string());
}

#[tokio::test]
async fn test_integrity_failure_is_compensated() {
    let h = Harness::new().await;
    h.store.inject_fault(Fault::CorruptLink, 1).await;

    let request = provision_request("mixed-up", "mixed@example.com");
    let err = h.engine.provision(request.clone(), h.ctx()).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::IntegrityVerificationFailed);
    assert!(err.is_invariant_violation());
    assert!(h.store.tenants().await.is_empty());
    assert!(h.store.owners().await.is_empty());
    assert_eq!(h.identity.user_count().await, 0);
    assert_eq!(
        request_status(&h, request.idempotency_key).await,
        ProvisioningStatus::RolledBack
    );
}

#[tokio::test]
async fn test_spawned_provision_finishes_after_handle_is_dropped() {
    let h = Harness::new().await;
    let request = provision_request("detached", "detached@example.com");
    let key = request.idempotency_key;

    let handle = h.engine.spawn_provision(request, h.ctx());
    let response = handle.await.unwrap().unwrap();

    assert_eq!(request_status(&h, key).await, ProvisioningStatus::Completed);
    assert!(h.store.find_tenant(response.tenant_id).await.unwrap().is_some());
}
