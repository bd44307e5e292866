//! Audit/trace log
//!
//! Every entry is emitted as a structured tracing event and appended to the
//! audit store. A failing audit sink is logged and otherwise ignored; it must
//! never abort a saga halfway.

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ProvisioningError;
use crate::models::{AuditEntry, AuditOutcome, NewAuditEntry};
use crate::store::Store;

pub struct AuditLog {
    store: Arc<dyn Store>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: NewAuditEntry) {
        emit(&entry);

        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(
                request_id = %entry.request_id,
                stage = %entry.stage,
                error = %e,
                "Failed to append audit entry"
            );
        }
    }

    /// Entries of one correlation id, oldest first
    pub async fn list(&self, request_id: Uuid) -> Result<Vec<AuditEntry>, ProvisioningError> {
        Ok(self.store.list_audit(request_id).await?)
    }
}

fn emit(entry: &NewAuditEntry) {
    let operation = entry.operation.as_str();
    let outcome = entry.outcome.as_str();
    let tenant_id = entry.tenant_id.map(|id| id.to_string()).unwrap_or_default();
    let error_code = entry.error_code.as_deref().unwrap_or("");
    let message = entry.message.as_deref().unwrap_or("");

    match entry.outcome {
        AuditOutcome::Started | AuditOutcome::Succeeded | AuditOutcome::Compensated => info!(
            request_id = %entry.request_id,
            tenant_id = %tenant_id,
            operation,
            stage = %entry.stage,
            outcome,
            duration_ms = entry.duration_ms,
            note = message,
            "audit"
        ),
        AuditOutcome::Failed => warn!(
            request_id = %entry.request_id,
            tenant_id = %tenant_id,
            operation,
            stage = %entry.stage,
            outcome,
            error_code,
            note = message,
            "audit"
        ),
        AuditOutcome::CompensationIncomplete => error!(
            request_id = %entry.request_id,
            tenant_id = %tenant_id,
            operation,
            stage = %entry.stage,
            outcome,
            error_code,
            note = message,
            details = %entry.details,
            "audit"
        ),
    }
}
