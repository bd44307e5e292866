/// Concurrent provisioning against the same slug, email or idempotency key
///
/// The store decides every race; these tests check that exactly one
/// attempt wins and that losers leave nothing behind.

mod common;

use common::{provision_request, Harness};
use futures::future::join_all;
use tablehost_shared::error::{ErrorCode, ProvisioningError};
use tablehost_shared::provisioning::ProvisionResponse;

const CONTENDERS: usize = 8;

async fn run_all(
    h: &Harness,
    requests: Vec<tablehost_shared::provisioning::ProvisionRequest>,
) -> Vec<Result<ProvisionResponse, ProvisioningError>> {
    let handles: Vec<_> = requests
        .into_iter()
        .map(|request| h.engine.spawn_provision(request, h.ctx()))
        .collect();

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("provisioning task panicked"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_slug_race_has_one_winner() {
    let h = Harness::new().await;
    let requests = (0..CONTENDERS)
        .map(|i| provision_request("contested", &format!("owner{}@example.com", i)))
        .collect();

    let results = run_all(&h, requests).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.code(), ErrorCode::SlugUnavailable, "unexpected loser error: {}", err);
    }

    assert_eq!(h.store.tenants().await.len(), 1);
    assert_eq!(h.identity.user_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_email_race_has_one_winner() {
    let h = Harness::new().await;
    let requests = (0..CONTENDERS)
        .map(|i| provision_request(&format!("bistro-{}", i), "shared@example.com"))
        .collect();

    let results = run_all(&h, requests).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.code(), ErrorCode::EmailUnavailable, "unexpected loser error: {}", err);
    }

    assert_eq!(h.store.tenants().await.len(), 1);
    assert_eq!(h.store.owners().await.len(), 1);
    assert_eq!(h.identity.user_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_race_provisions_once() {
    let h = Harness::new().await;
    let request = provision_request("one-key", "key@example.com");
    let requests = (0..CONTENDERS).map(|_| request.clone()).collect();

    let results = run_all(&h, requests).await;

    let responses: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert!(!responses.is_empty());
    assert!(responses.iter().all(|r| *r == responses[0]));
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.code(), ErrorCode::DuplicateRequest);
    }

    assert_eq!(h.store.tenants().await.len(), 1);
    assert_eq!(h.store.requests().await.len(), 1);
    assert_eq!(h.identity.calls().await.create, 1);
}
