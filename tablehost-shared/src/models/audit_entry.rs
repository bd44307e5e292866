//! Append-only audit trail
//!
//! Every orchestration stage, compensation step, credential mutation and
//! lifecycle change writes one entry. The table rejects UPDATE and DELETE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

/// Operation an audit entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Provision,
    CredentialUpdate,
    Reconcile,
    TenantLifecycle,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Provision => "provision",
            AuditOperation::CredentialUpdate => "credential_update",
            AuditOperation::Reconcile => "reconcile",
            AuditOperation::TenantLifecycle => "tenant_lifecycle",
        }
    }
}

impl FromStr for AuditOperation {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(AuditOperation::Provision),
            "credential_update" => Ok(AuditOperation::CredentialUpdate),
            "reconcile" => Ok(AuditOperation::Reconcile),
            "tenant_lifecycle" => Ok(AuditOperation::TenantLifecycle),
            other => Err(ParseEnumError::new("audit operation", other)),
        }
    }
}

impl TryFrom<String> for AuditOperation {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Outcome of the audited step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Started,
    Succeeded,
    Failed,
    Compensated,
    CompensationIncomplete,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Started => "started",
            AuditOutcome::Succeeded => "succeeded",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Compensated => "compensated",
            AuditOutcome::CompensationIncomplete => "compensation_incomplete",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(AuditOutcome::Started),
            "succeeded" => Ok(AuditOutcome::Succeeded),
            "failed" => Ok(AuditOutcome::Failed),
            "compensated" => Ok(AuditOutcome::Compensated),
            "compensation_incomplete" => Ok(AuditOutcome::CompensationIncomplete),
            other => Err(ParseEnumError::new("audit outcome", other)),
        }
    }
}

impl TryFrom<String> for AuditOutcome {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Stored audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,

    /// Correlation id of the request that produced the entry
    pub request_id: Uuid,

    pub idempotency_key: Option<Uuid>,
    pub tenant_id: Option<Uuid>,

    #[sqlx(try_from = "String")]
    pub operation: AuditOperation,

    /// Stage name (a provisioning status, or a step such as `compensate_identity`)
    pub stage: String,

    #[sqlx(try_from = "String")]
    pub outcome: AuditOutcome,

    pub error_code: Option<String>,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,

    /// Administrator or component that triggered the step
    pub actor_id: Option<Uuid>,

    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Entry to append
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub request_id: Uuid,
    pub idempotency_key: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub operation: AuditOperation,
    pub stage: String,
    pub outcome: AuditOutcome,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub actor_id: Option<Uuid>,
    pub details: serde_json::Value,
}

impl NewAuditEntry {
    /// Starts an entry with only the mandatory fields set
    pub fn new(
        request_id: Uuid,
        operation: AuditOperation,
        stage: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            request_id,
            idempotency_key: None,
            tenant_id: None,
            operation,
            stage: stage.into(),
            outcome,
            error_code: None,
            message: None,
            duration_ms: None,
            actor_id: None,
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn idempotency_key(mut self, key: Uuid) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.message = Some(message.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl AuditEntry {
    pub fn from_new(id: Uuid, data: NewAuditEntry, now: DateTime<Utc>) -> Self {
        Self {
            id,
            request_id: data.request_id,
            idempotency_key: data.idempotency_key,
            tenant_id: data.tenant_id,
            operation: data.operation,
            stage: data.stage,
            outcome: data.outcome,
            error_code: data.error_code,
            message: data.message,
            duration_ms: data.duration_ms,
            actor_id: data.actor_id,
            details: data.details,
            created_at: now,
        }
    }

    pub async fn insert<'e, E>(executor: E, data: &NewAuditEntry) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, AuditEntry>(
            r#"
            INSERT INTO audit_log
                (id, request_id, idempotency_key, tenant_id, operation, stage, outcome,
                 error_code, message, duration_ms, actor_id, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id, request_id, idempotency_key, tenant_id, operation, stage, outcome,
                      error_code, message, duration_ms, actor_id, details, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data.request_id)
        .bind(data.idempotency_key)
        .bind(data.tenant_id)
        .bind(data.operation.as_str())
        .bind(&data.stage)
        .bind(data.outcome.as_str())
        .bind(&data.error_code)
        .bind(&data.message)
        .bind(data.duration_ms)
        .bind(data.actor_id)
        .bind(&data.details)
        .fetch_one(executor)
        .await
    }

    /// Lists the entries of one correlation id in insertion order
    pub async fn list_by_request<'e, E>(executor: E, request_id: Uuid) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, request_id, idempotency_key, tenant_id, operation, stage, outcome,
                   error_code, message, duration_ms, actor_id, details, created_at
            FROM audit_log
            WHERE request_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(executor)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_optional_fields() {
        let request_id = Uuid::new_v4();
        let key = Uuid::new_v4();
        let entry = NewAuditEntry::new(request_id, AuditOperation::Provision, "validating", AuditOutcome::Failed)
            .idempotency_key(key)
            .error("SLUG_UNAVAILABLE", "slug taken")
            .duration_ms(12);

        assert_eq!(entry.idempotency_key, Some(key));
        assert_eq!(entry.error_code.as_deref(), Some("SLUG_UNAVAILABLE"));
        assert_eq!(entry.duration_ms, Some(12));
        assert!(entry.details.is_object());
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!(
            "compensation_incomplete".parse::<AuditOutcome>(),
            Ok(AuditOutcome::CompensationIncomplete)
        );
        assert_eq!("reconcile".parse::<AuditOperation>(), Ok(AuditOperation::Reconcile));
    }
}
