//! Provisioning request model
//!
//! One row per idempotency key. The row is created when an attempt begins,
//! advanced by the orchestrator at every stage, and frozen once it reaches a
//! terminal status. Rows are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

/// Saga status of a provisioning attempt
///
/// ```text
/// initiated -> validating -> creating_tenant_record -> creating_identity
///           -> linking_identity -> verifying -> completed
///
/// initiated | validating | creating_tenant_record          -> failed
/// creating_tenant_record | creating_identity
///   | linking_identity | verifying                         -> rolling_back -> rolled_back
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    Initiated,
    Validating,
    CreatingTenantRecord,
    CreatingIdentity,
    LinkingIdentity,
    Verifying,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl ProvisioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStatus::Initiated => "initiated",
            ProvisioningStatus::Validating => "validating",
            ProvisioningStatus::CreatingTenantRecord => "creating_tenant_record",
            ProvisioningStatus::CreatingIdentity => "creating_identity",
            ProvisioningStatus::LinkingIdentity => "linking_identity",
            ProvisioningStatus::Verifying => "verifying",
            ProvisioningStatus::Completed => "completed",
            ProvisioningStatus::Failed => "failed",
            ProvisioningStatus::RollingBack => "rolling_back",
            ProvisioningStatus::RolledBack => "rolled_back",
        }
    }

    /// Terminal records are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningStatus::Completed | ProvisioningStatus::Failed | ProvisioningStatus::RolledBack
        )
    }

    /// Checks an edge of the saga state machine
    pub fn can_transition_to(&self, next: ProvisioningStatus) -> bool {
        use ProvisioningStatus::*;

        matches!(
            (self, next),
            (Initiated, Validating)
                | (Validating, CreatingTenantRecord)
                | (CreatingTenantRecord, CreatingIdentity)
                | (CreatingIdentity, LinkingIdentity)
                | (LinkingIdentity, Verifying)
                | (Verifying, Completed)
                | (Initiated, Failed)
                | (Validating, Failed)
                | (CreatingTenantRecord, Failed)
                | (CreatingTenantRecord, RollingBack)
                | (CreatingIdentity, RollingBack)
                | (LinkingIdentity, RollingBack)
                | (Verifying, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    /// All statuses that are not terminal, for sweeping stalled attempts
    pub fn non_terminal() -> [ProvisioningStatus; 7] {
        use ProvisioningStatus::*;
        [
            Initiated,
            Validating,
            CreatingTenantRecord,
            CreatingIdentity,
            LinkingIdentity,
            Verifying,
            RollingBack,
        ]
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ProvisioningStatus::*;

        match s {
            "initiated" => Ok(Initiated),
            "validating" => Ok(Validating),
            "creating_tenant_record" => Ok(CreatingTenantRecord),
            "creating_identity" => Ok(CreatingIdentity),
            "linking_identity" => Ok(LinkingIdentity),
            "verifying" => Ok(Verifying),
            "completed" => Ok(Completed),
            "failed" => Ok(Failed),
            "rolling_back" => Ok(RollingBack),
            "rolled_back" => Ok(RolledBack),
            other => Err(ParseEnumError::new("provisioning status", other)),
        }
    }
}

impl TryFrom<String> for ProvisioningStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Provisioning request row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    /// Correlation id, echoed in every response and audit entry
    pub request_id: Uuid,

    /// Client-supplied idempotency key
    pub idempotency_key: Uuid,

    /// Administrator who invoked the provisioning
    pub requester_id: Uuid,

    pub tenant_slug: String,
    pub owner_email: String,

    #[sqlx(try_from = "String")]
    pub status: ProvisioningStatus,

    pub tenant_id: Option<Uuid>,
    pub owner_id: Option<Uuid>,

    /// SHA-256 hex digest of the canonical request payload
    pub payload_fingerprint: String,

    pub request_payload: serde_json::Value,

    /// Stored response replayed verbatim for retries (success or error body)
    pub response_payload: Option<serde_json::Value>,

    pub error_code: Option<String>,
    pub error_message: Option<String>,

    /// Set when compensation could not delete the external identity
    pub compensation_incomplete: bool,
    pub orphaned_identity_id: Option<Uuid>,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for opening a provisioning request
#[derive(Debug, Clone)]
pub struct NewProvisioningRequest {
    pub request_id: Uuid,
    pub idempotency_key: Uuid,
    pub requester_id: Uuid,
    pub tenant_slug: String,
    pub owner_email: String,
    pub payload_fingerprint: String,
    pub request_payload: serde_json::Value,
}

/// Terminal outcome written by `complete`
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: ProvisioningStatus,
    pub response_payload: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub compensation_incomplete: bool,
    pub orphaned_identity_id: Option<Uuid>,
}

impl ProvisioningRequest {
    /// Builds the in-memory record for a freshly opened request
    pub fn initiated(data: NewProvisioningRequest, now: DateTime<Utc>) -> Self {
        Self {
            request_id: data.request_id,
            idempotency_key: data.idempotency_key,
            requester_id: data.requester_id,
            tenant_slug: data.tenant_slug,
            owner_email: data.owner_email,
            status: ProvisioningStatus::Initiated,
            tenant_id: None,
            owner_id: None,
            payload_fingerprint: data.payload_fingerprint,
            request_payload: data.request_payload,
            response_payload: None,
            error_code: None,
            error_message: None,
            compensation_incomplete: false,
            orphaned_identity_id: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Inserts the request unless the key already exists
    ///
    /// Returns `None` when another writer owns the key. The unique constraint
    /// on `idempotency_key` makes this the single arbiter of concurrent
    /// retries.
    pub async fn insert_if_absent<'e, E>(
        executor: E,
        data: &NewProvisioningRequest,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, ProvisioningRequest>(
            r#"
            INSERT INTO provisioning_requests
                (request_id, idempotency_key, requester_id, tenant_slug, owner_email,
                 status, payload_fingerprint, request_payload)
            VALUES ($1, $2, $3, $4, $5, 'initiated', $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING request_id, idempotency_key, requester_id, tenant_slug, owner_email,
                      status, tenant_id, owner_id, payload_fingerprint, request_payload,
                      response_payload, error_code, error_message, compensation_incomplete,
                      orphaned_identity_id, started_at, updated_at, completed_at
            "#,
        )
        .bind(data.request_id)
        .bind(data.idempotency_key)
        .bind(data.requester_id)
        .bind(&data.tenant_slug)
        .bind(&data.owner_email)
        .bind(&data.payload_fingerprint)
        .bind(&data.request_payload)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_key<'e, E>(executor: E, key: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, ProvisioningRequest>(
            r#"
            SELECT request_id, idempotency_key, requester_id, tenant_slug, owner_email,
                   status, tenant_id, owner_id, payload_fingerprint, request_payload,
                   response_payload, error_code, error_message, compensation_incomplete,
                   orphaned_identity_id, started_at, updated_at, completed_at
            FROM provisioning_requests
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(executor)
        .await
    }

    /// Moves a request forward, guarded by its expected current status
    ///
    /// `tenant_id` / `owner_id` are only written when provided. Returns `None`
    /// if the row was not in `from`.
    pub async fn advance<'e, E>(
        executor: E,
        key: Uuid,
        from: ProvisioningStatus,
        to: ProvisioningStatus,
        tenant_id: Option<Uuid>,
        owner_id: Option<Uuid>,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, ProvisioningRequest>(
            r#"
            UPDATE provisioning_requests
            SET status = $3,
                tenant_id = COALESCE($4, tenant_id),
                owner_id = COALESCE($5, owner_id),
                updated_at = NOW()
            WHERE idempotency_key = $1 AND status = $2
            RETURNING request_id, idempotency_key, requester_id, tenant_slug, owner_email,
                      status, tenant_id, owner_id, payload_fingerprint, request_payload,
                      response_payload, error_code, error_message, compensation_incomplete,
                      orphaned_identity_id, started_at, updated_at, completed_at
            "#,
        )
        .bind(key)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(tenant_id)
        .bind(owner_id)
        .fetch_optional(executor)
        .await
    }

    /// Writes the terminal outcome, guarded by the expected current status
    pub async fn complete<'e, E>(
        executor: E,
        key: Uuid,
        from: ProvisioningStatus,
        completion: &Completion,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, ProvisioningRequest>(
            r#"
            UPDATE provisioning_requests
            SET status = $3,
                response_payload = $4,
                error_code = $5,
                error_message = $6,
                compensation_incomplete = $7,
                orphaned_identity_id = $8,
                updated_at = NOW(),
                completed_at = NOW()
            WHERE idempotency_key = $1 AND status = $2
            RETURNING request_id, idempotency_key, requester_id, tenant_slug, owner_email,
                      status, tenant_id, owner_id, payload_fingerprint, request_payload,
                      response_payload, error_code, error_message, compensation_incomplete,
                      orphaned_identity_id, started_at, updated_at, completed_at
            "#,
        )
        .bind(key)
        .bind(from.as_str())
        .bind(completion.status.as_str())
        .bind(&completion.response_payload)
        .bind(&completion.error_code)
        .bind(&completion.error_message)
        .bind(completion.compensation_incomplete)
        .bind(completion.orphaned_identity_id)
        .fetch_optional(executor)
        .await
    }

    /// Lists non-terminal requests not touched since `older_than`, oldest first
    pub async fn list_stalled<'e, E>(
        executor: E,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, ProvisioningRequest>(
            r#"
            SELECT request_id, idempotency_key, requester_id, tenant_slug, owner_email,
                   status, tenant_id, owner_id, payload_fingerprint, request_payload,
                   response_payload, error_code, error_message, compensation_incomplete,
                   orphaned_identity_id, started_at, updated_at, completed_at
            FROM provisioning_requests
            WHERE status NOT IN ('completed', 'failed', 'rolled_back')
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(executor)
        .await
    }

    /// Claims a stalled request by bumping `updated_at`
    ///
    /// Only one sweeper wins the claim; the others get `None`.
    pub async fn claim_stalled<'e, E>(
        executor: E,
        key: Uuid,
        status: ProvisioningStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, ProvisioningRequest>(
            r#"
            UPDATE provisioning_requests
            SET updated_at = NOW()
            WHERE idempotency_key = $1 AND status = $2 AND updated_at < $3
            RETURNING request_id, idempotency_key, requester_id, tenant_slug, owner_email,
                      status, tenant_id, owner_id, payload_fingerprint, request_payload,
                      response_payload, error_code, error_message, compensation_incomplete,
                      orphaned_identity_id, started_at, updated_at, completed_at
            "#,
        )
        .bind(key)
        .bind(status.as_str())
        .bind(older_than)
        .fetch_optional(executor)
        .await
    }
}
