//! Idempotency ledger
//!
//! One row per idempotency key. The first writer of a key wins through the
//! unique constraint; every later caller with the same key gets the existing
//! record back and either replays its stored outcome or is told the request
//! is still in progress.
//!
//! Status changes go through [`Ledger::advance`] and [`Ledger::complete`],
//! which enforce the provisioning state machine before the guarded update.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProvisioningError;
use crate::models::provisioning_request::Completion;
use crate::models::{NewProvisioningRequest, ProvisioningRequest, ProvisioningStatus};
use crate::store::Store;

/// SHA-256 hex digest of a payload's canonical JSON
///
/// `serde_json::Value` objects keep their keys sorted, so the digest does not
/// depend on the order fields arrived in.
pub fn fingerprint(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Result of [`Ledger::begin`]
#[derive(Debug, Clone)]
pub enum Begin {
    /// This caller owns the key
    New(ProvisioningRequest),
    /// The key was already recorded by an earlier call
    Existing(ProvisioningRequest),
}

pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records the key in `initiated`, or returns the record already holding it
    pub async fn begin(&self, request: &NewProvisioningRequest) -> Result<Begin, ProvisioningError> {
        if let Some(record) = self.store.insert_request_if_absent(request).await? {
            debug!(idempotency_key = %request.idempotency_key, "Provisioning request recorded");
            return Ok(Begin::New(record));
        }

        match self.store.find_request(request.idempotency_key).await? {
            Some(existing) => Ok(Begin::Existing(existing)),
            None => Err(ProvisioningError::Internal(format!(
                "idempotency key {} reported as taken but not found",
                request.idempotency_key
            ))),
        }
    }

    pub async fn find(&self, key: Uuid) -> Result<Option<ProvisioningRequest>, ProvisioningError> {
        Ok(self.store.find_request(key).await?)
    }

    /// Moves `record` to `to`, recording ids when given
    pub async fn advance(
        &self,
        record: &ProvisioningRequest,
        to: ProvisioningStatus,
        tenant_id: Option<Uuid>,
        owner_id: Option<Uuid>,
    ) -> Result<ProvisioningRequest, ProvisioningError> {
        if !record.status.can_transition_to(to) {
            return Err(ProvisioningError::Internal(format!(
                "illegal provisioning transition {} -> {}",
                record.status, to
            )));
        }

        self.store
            .advance_request(record.idempotency_key, record.status, to, tenant_id, owner_id)
            .await?
            .ok_or_else(|| {
                warn!(
                    idempotency_key = %record.idempotency_key,
                    expected = %record.status,
                    "Provisioning request changed concurrently"
                );
                ProvisioningError::Internal(format!(
                    "provisioning request {} is no longer in {}",
                    record.idempotency_key, record.status
                ))
            })
    }

    /// Finalizes `record`
    ///
    /// Completing a record that is already terminal is a no-op that returns
    /// the stored record.
    pub async fn complete(
        &self,
        record: &ProvisioningRequest,
        completion: &Completion,
    ) -> Result<ProvisioningRequest, ProvisioningError> {
        if !completion.status.is_terminal() || !record.status.can_transition_to(completion.status) {
            if record.status.is_terminal() {
                return Ok(record.clone());
            }
            return Err(ProvisioningError::Internal(format!(
                "illegal provisioning transition {} -> {}",
                record.status, completion.status
            )));
        }

        if let Some(done) = self
            .store
            .complete_request(record.idempotency_key, record.status, completion)
            .await?
        {
            return Ok(done);
        }

        match self.store.find_request(record.idempotency_key).await? {
            Some(current) if current.status.is_terminal() => Ok(current),
            _ => Err(ProvisioningError::Internal(format!(
                "provisioning request {} is no longer in {}",
                record.idempotency_key, record.status
            ))),
        }
    }

    /// Non-terminal requests not touched since `older_than`
    pub async fn list_stalled(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ProvisioningRequest>, ProvisioningError> {
        Ok(self.store.list_stalled_requests(older_than, limit).await?)
    }

    /// Takes over a stalled request; `None` when another sweeper was faster
    pub async fn claim(
        &self,
        record: &ProvisioningRequest,
        older_than: DateTime<Utc>,
    ) -> Result<Option<ProvisioningRequest>, ProvisioningError> {
        Ok(self
            .store
            .claim_stalled_request(record.idempotency_key, record.status, older_than)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn new_request(key: Uuid) -> NewProvisioningRequest {
        let payload = json!({ "tenant": { "slug": "acme-bistro" } });
        NewProvisioningRequest {
            request_id: Uuid::new_v4(),
            idempotency_key: key,
            requester_id: Uuid::new_v4(),
            tenant_slug: "acme-bistro".to_string(),
            owner_email: "owner1@example.com".to_string(),
            payload_fingerprint: fingerprint(&payload),
            request_payload: payload,
        }
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({ "a": 1, "b": { "x": true, "y": "z" } });
        let b: serde_json::Value = serde_json::from_str(r#"{"b":{"y":"z","x":true},"a":1}"#).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&json!({ "a": 2 })));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let key = Uuid::new_v4();

        assert!(matches!(ledger.begin(&new_request(key)).await.unwrap(), Begin::New(_)));
        match ledger.begin(&new_request(key)).await.unwrap() {
            Begin::Existing(record) => assert_eq!(record.status, ProvisioningStatus::Initiated),
            Begin::New(_) => panic!("key recorded twice"),
        }
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let record = match ledger.begin(&new_request(Uuid::new_v4())).await.unwrap() {
            Begin::New(record) => record,
            Begin::Existing(_) => unreachable!(),
        };

        let err = ledger
            .advance(&record, ProvisioningStatus::Verifying, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Internal(_)));
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let record = match ledger.begin(&new_request(Uuid::new_v4())).await.unwrap() {
            Begin::New(record) => record,
            Begin::Existing(_) => unreachable!(),
        };

        let failed = Completion {
            status: ProvisioningStatus::Failed,
            response_payload: None,
            error_code: Some("VALIDATION_FAILED".to_string()),
            error_message: Some("bad input".to_string()),
            compensation_incomplete: false,
            orphaned_identity_id: None,
        };
        let done = ledger.complete(&record, &failed).await.unwrap();
        assert_eq!(done.status, ProvisioningStatus::Failed);

        // Second completion with the stale record returns the stored outcome.
        let again = ledger.complete(&record, &failed).await.unwrap();
        assert_eq!(again.status, ProvisioningStatus::Failed);
        assert_eq!(again.error_message.as_deref(), Some("bad input"));

        // Completing the terminal record itself is a no-op.
        let noop = ledger.complete(&done, &failed).await.unwrap();
        assert_eq!(noop.completed_at, done.completed_at);
    }

    #[tokio::test]
    async fn test_stale_advance_reports_conflict() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let record = match ledger.begin(&new_request(Uuid::new_v4())).await.unwrap() {
            Begin::New(record) => record,
            Begin::Existing(_) => unreachable!(),
        };

        ledger
            .advance(&record, ProvisioningStatus::Validating, None, None)
            .await
            .unwrap();
        assert!(ledger
            .advance(&record, ProvisioningStatus::Validating, None, None)
            .await
            .is_err());
    }
}
