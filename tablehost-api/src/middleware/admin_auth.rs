/// Administrator authentication
///
/// Validates the bearer JWT, then asks the identity classifier whether the
/// subject is still an administrator. The check runs on every request, so
/// removing an administrator locks them out immediately even with an
/// unexpired token.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tablehost_shared::auth::jwt;
use tracing::warn;
use uuid::Uuid;

use super::request_id::RequestId;
use crate::{app::AppState, error::ApiError};

/// Administrator performing the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminContext {
    pub admin_id: Uuid,
}

pub async fn admin_auth_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0)
        .unwrap_or_else(Uuid::new_v4);

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing authorization header", request_id))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("Expected Bearer token", request_id))?;

    let claims =
        jwt::validate_token(token, state.jwt_secret()).map_err(|e| ApiError::from_jwt(e, request_id))?;

    let is_admin = state
        .engine
        .classifier()
        .is_administrator(claims.sub)
        .await
        .map_err(|e| ApiError::engine(e.into(), request_id))?;
    if !is_admin {
        warn!(subject = %claims.sub, "Token subject is not an administrator");
        return Err(ApiError::forbidden("Administrator access required", request_id));
    }

    req.extensions_mut().insert(AdminContext { admin_id: claims.sub });

    Ok(next.run(req).await)
}
