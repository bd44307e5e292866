/// Provisioning request lookup
///
/// Lets a client that got `202 Accepted` (or lost the response entirely)
/// find out where its attempt stands, and lets operators read the audit
/// trail of one attempt.
///
/// - `GET /v1/provisioning-requests/:idempotency_key`
/// - `GET /v1/provisioning-requests/:idempotency_key/audit`

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    middleware::request_id::RequestId,
};
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use tablehost_shared::models::{AuditEntry, ProvisioningRequest};
use uuid::Uuid;

async fn lookup(state: &AppState, request_id: Uuid, key: Uuid) -> ApiResult<ProvisioningRequest> {
    state
        .engine
        .ledger()
        .find(key)
        .await
        .map_err(|e| ApiError::engine(e, request_id))?
        .ok_or_else(|| ApiError::not_found(format!("No provisioning request with idempotency key {}", key), request_id))
}

pub async fn get_request(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(key): Path<Uuid>,
) -> ApiResult<Json<ProvisioningRequest>> {
    lookup(&state, request_id, key).await.map(Json)
}

/// Audit entries of the attempt, oldest first
pub async fn get_audit(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(key): Path<Uuid>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let record = lookup(&state, request_id, key).await?;

    state
        .engine
        .audit()
        .list(record.request_id)
        .await
        .map(Json)
        .map_err(|e| ApiError::engine(e, request_id))
}
