/// Tenant endpoints
///
/// - `POST /v1/tenants/provision` - Provision a tenant and its owner
/// - `PUT /v1/tenants/:tenant_id/owner/credentials` - Change owner email/password
/// - `POST /v1/tenants/:tenant_id/suspend` - Suspend an active tenant
/// - `POST /v1/tenants/:tenant_id/reactivate` - Reactivate a suspended tenant
/// - `POST /v1/tenants/:tenant_id/archive` - Archive a tenant
///
/// # Example Request
///
/// ```json
/// {
///   "idempotencyKey": "0e5a7a4c-38b7-4a52-8a8f-3c0c8f1d2b11",
///   "tenant": {
///     "name": "Acme Bistro",
///     "slug": "acme-bistro",
///     "timezone": "Europe/Berlin",
///     "currency": "EUR"
///   },
///   "owner": { "email": "owner@acme.test", "name": "Ada Owner" }
/// }
/// ```

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    middleware::{admin_auth::AdminContext, request_id::RequestId},
};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tablehost_shared::{
    error::ProvisioningError,
    models::{ProvisioningStatus, Tenant},
    provisioning::{
        CredentialUpdate, CredentialUpdateResponse, LifecycleAction, ProvisionRequest, RequestContext,
    },
};
use tracing::{info, warn};
use uuid::Uuid;

/// Returned when the saga outlives the configured wait
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionAccepted {
    pub request_id: Uuid,
    pub idempotency_key: Uuid,
    pub status: ProvisioningStatus,
}

/// Extracts a JSON body, reporting malformed input as `VALIDATION_FAILED`
fn body<T>(payload: Result<Json<T>, JsonRejection>, request_id: Uuid) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::engine(ProvisioningError::Validation(rejection.body_text()), request_id))
}

/// Provision endpoint handler
///
/// The saga runs on its own task. The handler waits up to
/// `PROVISION_WAIT_SECONDS` for it; if the saga is still running after
/// that, the caller gets `202 Accepted` with the ledger status and can poll
/// `GET /v1/provisioning-requests/:key` or retry with the same key.
///
/// # Errors
///
/// - 422 `VALIDATION_FAILED`: malformed body, bad slug or email
/// - 409 `SLUG_UNAVAILABLE`, `EMAIL_UNAVAILABLE`, `DUPLICATE_REQUEST`
/// - 503 `IDENTITY_PROVIDER_UNAVAILABLE`
/// - 500 `INTEGRITY_VERIFICATION_FAILED`, `INTERNAL_ERROR`
pub async fn provision(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(admin): Extension<AdminContext>,
    payload: Result<Json<ProvisionRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = body(payload, request_id)?;
    let idempotency_key = request.idempotency_key;
    let ctx = RequestContext::new(request_id, admin.admin_id);

    let handle = state.engine.spawn_provision(request, ctx);

    match tokio::time::timeout(state.config.provision_wait(), handle).await {
        Ok(Ok(Ok(response))) => Ok((StatusCode::OK, Json(response)).into_response()),
        Ok(Ok(Err(e))) => Err(ApiError::engine(e, request_id)),
        Ok(Err(join_error)) => Err(ApiError::engine(
            ProvisioningError::Internal(format!("provisioning task failed: {}", join_error)),
            request_id,
        )),
        Err(_) => {
            let record = state
                .engine
                .ledger()
                .find(idempotency_key)
                .await
                .map_err(|e| ApiError::engine(e, request_id))?;
            let (request_id, status) = record
                .map(|r| (r.request_id, r.status))
                .unwrap_or((request_id, ProvisioningStatus::Initiated));

            info!(
                request_id = %request_id,
                idempotency_key = %idempotency_key,
                status = %status,
                "Provisioning still running, answering 202"
            );

            Ok((
                StatusCode::ACCEPTED,
                Json(ProvisionAccepted {
                    request_id,
                    idempotency_key,
                    status,
                }),
            )
                .into_response())
        }
    }
}

/// Credential update endpoint handler
///
/// # Errors
///
/// - 422 `VALIDATION_FAILED`: empty update, weak password, malformed email
/// - 404 `TENANT_NOT_FOUND`
/// - 403 `ADMIN_CREDENTIAL_PROTECTION_VIOLATION`: owner is an administrator
/// - 409 `EMAIL_UNAVAILABLE`, `INVALID_TENANT_STATE`
/// - 503 `IDENTITY_PROVIDER_UNAVAILABLE`
pub async fn update_credentials(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(admin): Extension<AdminContext>,
    Path(tenant_id): Path<Uuid>,
    payload: Result<Json<CredentialUpdate>, JsonRejection>,
) -> ApiResult<Json<CredentialUpdateResponse>> {
    let update = body(payload, request_id)?;
    let ctx = RequestContext::new(request_id, admin.admin_id);

    let response = state
        .engine
        .update_owner_credentials(tenant_id, update, ctx)
        .await
        .map_err(|e| {
            if e.is_invariant_violation() {
                warn!(request_id = %request_id, tenant_id = %tenant_id, code = e.code().as_str(), "Credential update refused");
            }
            ApiError::engine(e, request_id)
        })?;

    Ok(Json(response))
}

async fn change_status(
    state: AppState,
    request_id: Uuid,
    admin: AdminContext,
    tenant_id: Uuid,
    action: LifecycleAction,
) -> ApiResult<Json<Tenant>> {
    let ctx = RequestContext::new(request_id, admin.admin_id);
    state
        .engine
        .change_tenant_status(tenant_id, action, ctx)
        .await
        .map(Json)
        .map_err(|e| ApiError::engine(e, request_id))
}

pub async fn suspend(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(admin): Extension<AdminContext>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Tenant>> {
    change_status(state, request_id, admin, tenant_id, LifecycleAction::Suspend).await
}

pub async fn reactivate(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(admin): Extension<AdminContext>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Tenant>> {
    change_status(state, request_id, admin, tenant_id, LifecycleAction::Reactivate).await
}

pub async fn archive(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(admin): Extension<AdminContext>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Tenant>> {
    change_status(state, request_id, admin, tenant_id, LifecycleAction::Archive).await
}
