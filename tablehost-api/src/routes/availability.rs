/// Availability endpoints
///
/// Advisory pre-flight checks for a provisioning form. A positive answer
/// is not a reservation: the database constraints decide at provisioning
/// time.
///
/// - `GET /v1/availability/slug?slug=acme-bistro`
/// - `GET /v1/availability/email?email=owner@acme.test`
///
/// # Example Response
///
/// ```json
/// { "available": false, "reason": "slug is already taken", "suggestion": "acme-bistro-2" }
/// ```

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    middleware::request_id::RequestId,
};
use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use tablehost_shared::provisioning::{EmailCheck, SlugCheck};

#[derive(Debug, Deserialize)]
pub struct SlugQuery {
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    pub email: String,
}

pub async fn check_slug(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<SlugQuery>,
) -> ApiResult<Json<SlugCheck>> {
    state
        .engine
        .validator()
        .check_slug(&query.slug)
        .await
        .map(Json)
        .map_err(|e| ApiError::engine(e, request_id))
}

pub async fn check_email(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<EmailQuery>,
) -> ApiResult<Json<EmailCheck>> {
    state
        .engine
        .validator()
        .check_email(&query.email)
        .await
        .map(Json)
        .map_err(|e| ApiError::engine(e, request_id))
}
