/// Error handling for the API server
///
/// This module provides a unified error type that maps to HTTP responses.
/// All handlers return `Result<T, ApiError>`, which renders the wire error
/// body `{code, message, suggestion?, requestId}`.
///
/// Engine failures keep their stable code and HTTP status; transport-level
/// failures (authentication, unknown lookups) use the extra codes
/// `UNAUTHORIZED`, `FORBIDDEN` and `NOT_FOUND`. Every body carries the
/// request id.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tablehost_shared::{
    auth::jwt::JwtError,
    error::{ErrorCode, ProvisioningError},
};
use uuid::Uuid;

/// API result type alias
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type
#[derive(Debug)]
pub enum ApiError {
    /// Unauthorized (401)
    Unauthorized { message: String, request_id: Uuid },

    /// Forbidden (403)
    Forbidden { message: String, request_id: Uuid },

    /// Not found (404)
    NotFound { message: String, request_id: Uuid },

    /// Engine failure, rendered with its own code and status
    Engine {
        error: ProvisioningError,
        request_id: Uuid,
    },
}

impl ApiError {
    pub fn engine(error: ProvisioningError, request_id: Uuid) -> Self {
        ApiError::Engine { error, request_id }
    }

    pub fn unauthorized(message: impl Into<String>, request_id: Uuid) -> Self {
        ApiError::Unauthorized {
            message: message.into(),
            request_id,
        }
    }

    pub fn forbidden(message: impl Into<String>, request_id: Uuid) -> Self {
        ApiError::Forbidden {
            message: message.into(),
            request_id,
        }
    }

    pub fn not_found(message: impl Into<String>, request_id: Uuid) -> Self {
        ApiError::NotFound {
            message: message.into(),
            request_id,
        }
    }

    /// Maps a rejected admin token to a 401
    pub fn from_jwt(err: JwtError, request_id: Uuid) -> Self {
        let message = match err {
            JwtError::Expired => "Token expired".to_string(),
            JwtError::InvalidIssuer { .. } => "Invalid token issuer".to_string(),
            _ => format!("Invalid token: {}", err),
        };
        ApiError::unauthorized(message, request_id)
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            ApiError::Unauthorized { request_id, .. }
            | ApiError::Forbidden { request_id, .. }
            | ApiError::NotFound { request_id, .. }
            | ApiError::Engine { request_id, .. } => *request_id,
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Machine-checkable error code (e.g. "SLUG_UNAVAILABLE")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Free alternative, for `SLUG_UNAVAILABLE`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    pub request_id: Uuid,
}

impl ErrorResponse {
    fn transport(code: &str, message: String, request_id: Uuid) -> Self {
        ErrorResponse {
            code: code.to_string(),
            message,
            suggestion: None,
            request_id,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized { message, .. } => write!(f, "Unauthorized: {}", message),
            ApiError::Forbidden { message, .. } => write!(f, "Forbidden: {}", message),
            ApiError::NotFound { message, .. } => write!(f, "Not found: {}", message),
            ApiError::Engine { error, .. } => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized { message, request_id } => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::transport("UNAUTHORIZED", message, request_id),
            ),
            ApiError::Forbidden { message, request_id } => (
                StatusCode::FORBIDDEN,
                ErrorResponse::transport("FORBIDDEN", message, request_id),
            ),
            ApiError::NotFound { message, request_id } => (
                StatusCode::NOT_FOUND,
                ErrorResponse::transport("NOT_FOUND", message, request_id),
            ),
            ApiError::Engine { error, request_id } => {
                let body = error.to_body(request_id);
                let status = StatusCode::from_u16(body.code.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

                // Log internal errors but don't expose details to clients
                let message = if body.code == ErrorCode::InternalError {
                    tracing::error!(request_id = %body.request_id, "Internal error: {}", body.message);
                    "An internal error occurred".to_string()
                } else {
                    body.message
                };

                (
                    status,
                    ErrorResponse {
                        code: body.code.as_str().to_string(),
                        message,
                        suggestion: body.suggestion,
                        request_id: body.request_id,
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablehost_shared::provisioning::ConflictSource;

    #[test]
    fn test_error_display() {
        let err = ApiError::forbidden("Administrator access required", Uuid::new_v4());
        assert_eq!(err.to_string(), "Forbidden: Administrator access required");

        let err = ApiError::not_found("Request not found", Uuid::new_v4());
        assert_eq!(err.to_string(), "Not found: Request not found");
    }

    #[test]
    fn test_engine_error_status() {
        let response = ApiError::engine(
            ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::Owner,
            },
            Uuid::new_v4(),
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response =
            ApiError::engine(ProvisioningError::TenantNotFound(Uuid::new_v4()), Uuid::new_v4()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::engine(
            ProvisioningError::IdentityProviderUnavailable("down".to_string()),
            Uuid::new_v4(),
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_jwt_error_is_unauthorized() {
        let request_id = Uuid::new_v4();
        let err = ApiError::from_jwt(JwtError::Expired, request_id);
        assert_eq!(err.request_id(), request_id);
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_transport_errors_carry_request_id() {
        let request_id = Uuid::new_v4();
        let response = ApiError::not_found("No such request", request_id).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "NOT_FOUND");
        assert_eq!(body.request_id, request_id);
        assert!(body.suggestion.is_none());
    }
}
