//! Error taxonomy of the provisioning engine
//!
//! Every failure surfaced to a caller carries a stable machine-checkable
//! [`ErrorCode`]. Its [`ErrorCategory`] depends on the saga step that raised
//! it as well as the code: an unreachable identity provider during the
//! email check is pre-flight, the same outage while creating the owner is
//! cross-system.
//!
//! | Category | Raised at | Side effects | Handling |
//! |---|---|---|---|
//! | Pre-flight | before any write | none | 4xx, safe to retry with corrected input |
//! | Transactional | transaction #1 | none (database rolled back) | 4xx |
//! | Cross-system | identity creation onwards | possibly an external identity | compensated, retried once |
//! | Invariant | any step | none allowed | never retried, logged at error level |

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::identity::IdentityError;
use crate::models::ProvisioningStatus;
use crate::provisioning::validator::ConflictSource;
use crate::store::StoreError;

/// Stable error codes exposed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    SlugUnavailable,
    EmailUnavailable,
    DuplicateRequest,
    IdentityProviderUnavailable,
    AdminCredentialProtectionViolation,
    IntegrityVerificationFailed,
    InternalError,
    TenantNotFound,
    InvalidTenantState,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::SlugUnavailable => "SLUG_UNAVAILABLE",
            ErrorCode::EmailUnavailable => "EMAIL_UNAVAILABLE",
            ErrorCode::DuplicateRequest => "DUPLICATE_REQUEST",
            ErrorCode::IdentityProviderUnavailable => "IDENTITY_PROVIDER_UNAVAILABLE",
            ErrorCode::AdminCredentialProtectionViolation => "ADMIN_CREDENTIAL_PROTECTION_VIOLATION",
            ErrorCode::IntegrityVerificationFailed => "INTEGRITY_VERIFICATION_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::TenantNotFound => "TENANT_NOT_FOUND",
            ErrorCode::InvalidTenantState => "INVALID_TENANT_STATE",
        }
    }

    /// HTTP status the API answers with
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ValidationFailed => 422,
            ErrorCode::SlugUnavailable
            | ErrorCode::EmailUnavailable
            | ErrorCode::DuplicateRequest
            | ErrorCode::InvalidTenantState => 409,
            ErrorCode::IdentityProviderUnavailable => 503,
            ErrorCode::AdminCredentialProtectionViolation => 403,
            ErrorCode::IntegrityVerificationFailed | ErrorCode::InternalError => 500,
            ErrorCode::TenantNotFound => 404,
        }
    }

    /// Admin protection and post-link verification failures
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            ErrorCode::AdminCredentialProtectionViolation | ErrorCode::IntegrityVerificationFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category, decides retry and logging policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PreFlight,
    Transactional,
    CrossSystem,
    Invariant,
}

impl ErrorCategory {
    /// Category of a failure with `code` raised while the saga was at `stage`
    ///
    /// Terminal stages only show up for replays and lifecycle calls, which
    /// have written nothing by the time they fail.
    pub fn classify(code: ErrorCode, stage: ProvisioningStatus) -> Self {
        if code.is_invariant() {
            return ErrorCategory::Invariant;
        }
        match stage {
            ProvisioningStatus::CreatingTenantRecord => ErrorCategory::Transactional,
            ProvisioningStatus::CreatingIdentity
            | ProvisioningStatus::LinkingIdentity
            | ProvisioningStatus::Verifying
            | ProvisioningStatus::RollingBack => ErrorCategory::CrossSystem,
            ProvisioningStatus::Initiated
            | ProvisioningStatus::Validating
            | ProvisioningStatus::Completed
            | ProvisioningStatus::Failed
            | ProvisioningStatus::RolledBack => ErrorCategory::PreFlight,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::PreFlight => "pre_flight",
            ErrorCategory::Transactional => "transactional",
            ErrorCategory::CrossSystem => "cross_system",
            ErrorCategory::Invariant => "invariant",
        }
    }
}

/// Error body returned to callers and stored for idempotent replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub request_id: Uuid,
}

/// Engine-level error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Slug '{slug}' is unavailable: {reason}")]
    SlugUnavailable {
        slug: String,
        reason: String,
        suggestion: Option<String>,
    },

    #[error("Email is unavailable: already used by {source_kind}")]
    EmailUnavailable { source_kind: ConflictSource },

    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    #[error("Identity provider unavailable: {0}")]
    IdentityProviderUnavailable(String),

    #[error("Identity {identity_id} is a platform administrator; its credentials cannot be managed here")]
    AdminCredentialProtectionViolation { identity_id: Uuid },

    #[error("Integrity verification failed: {0}")]
    IntegrityVerificationFailed(String),

    #[error("Tenant {0} not found")]
    TenantNotFound(Uuid),

    #[error("Tenant is in an invalid state: {0}")]
    InvalidTenantState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A stored failure replayed verbatim for a retried idempotency key
    #[error("{}", .0.message)]
    Replayed(ErrorBody),
}

impl ProvisioningError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProvisioningError::Validation(_) => ErrorCode::ValidationFailed,
            ProvisioningError::SlugUnavailable { .. } => ErrorCode::SlugUnavailable,
            ProvisioningError::EmailUnavailable { .. } => ErrorCode::EmailUnavailable,
            ProvisioningError::DuplicateRequest(_) => ErrorCode::DuplicateRequest,
            ProvisioningError::IdentityProviderUnavailable(_) => ErrorCode::IdentityProviderUnavailable,
            ProvisioningError::AdminCredentialProtectionViolation { .. } => {
                ErrorCode::AdminCredentialProtectionViolation
            }
            ProvisioningError::IntegrityVerificationFailed(_) => ErrorCode::IntegrityVerificationFailed,
            ProvisioningError::TenantNotFound(_) => ErrorCode::TenantNotFound,
            ProvisioningError::InvalidTenantState(_) => ErrorCode::InvalidTenantState,
            ProvisioningError::Internal(_) => ErrorCode::InternalError,
            ProvisioningError::Replayed(body) => body.code,
        }
    }

    /// Category of this failure when raised at saga step `stage`
    pub fn category_at(&self, stage: ProvisioningStatus) -> ErrorCategory {
        ErrorCategory::classify(self.code(), stage)
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            ProvisioningError::SlugUnavailable { suggestion, .. } => suggestion.as_deref(),
            ProvisioningError::Replayed(body) => body.suggestion.as_deref(),
            _ => None,
        }
    }

    /// Whether the failure is an invariant violation (never retried)
    pub fn is_invariant_violation(&self) -> bool {
        self.code().is_invariant()
    }

    /// Renders the wire body; replays keep their original request id
    pub fn to_body(&self, request_id: Uuid) -> ErrorBody {
        match self {
            ProvisioningError::Replayed(body) => body.clone(),
            other => ErrorBody {
                code: other.code(),
                message: other.to_string(),
                suggestion: other.suggestion().map(str::to_string),
                request_id,
            },
        }
    }
}

impl From<StoreError> for ProvisioningError {
    fn from(err: StoreError) -> Self {
        ProvisioningError::Internal(err.to_string())
    }
}

impl From<IdentityError> for ProvisioningError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::EmailAlreadyExists => ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::IdentityProvider,
            },
            IdentityError::ProviderUnavailable(msg) => ProvisioningError::IdentityProviderUnavailable(msg),
            IdentityError::InvalidRequest(msg) => ProvisioningError::Validation(msg),
            IdentityError::NotFound => {
                ProvisioningError::IntegrityVerificationFailed("identity not found at provider".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::AdminCredentialProtectionViolation).unwrap();
        assert_eq!(json, "\"ADMIN_CREDENTIAL_PROTECTION_VIOLATION\"");
        assert_eq!(ErrorCode::SlugUnavailable.as_str(), "SLUG_UNAVAILABLE");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorCode::ValidationFailed.http_status(), 422);
        assert_eq!(ErrorCode::SlugUnavailable.http_status(), 409);
        assert_eq!(ErrorCode::EmailUnavailable.http_status(), 409);
        assert_eq!(ErrorCode::DuplicateRequest.http_status(), 409);
        assert_eq!(ErrorCode::IdentityProviderUnavailable.http_status(), 503);
        assert_eq!(ErrorCode::AdminCredentialProtectionViolation.http_status(), 403);
        assert_eq!(ErrorCode::IntegrityVerificationFailed.http_status(), 500);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
        assert_eq!(ErrorCode::TenantNotFound.http_status(), 404);
    }

    #[test]
    fn test_invariant_category() {
        assert!(ProvisioningError::AdminCredentialProtectionViolation { identity_id: Uuid::nil() }
            .is_invariant_violation());
        assert!(ProvisioningError::IntegrityVerificationFailed("x".into()).is_invariant_violation());
        assert!(!ProvisioningError::Validation("x".into()).is_invariant_violation());
    }

    #[test]
    fn test_category_follows_saga_step() {
        let outage = ProvisioningError::IdentityProviderUnavailable("down".into());
        assert_eq!(outage.category_at(ProvisioningStatus::Validating), ErrorCategory::PreFlight);
        assert_eq!(outage.category_at(ProvisioningStatus::CreatingIdentity), ErrorCategory::CrossSystem);

        let taken = ProvisioningError::SlugUnavailable {
            slug: "acme-bistro".into(),
            reason: "already taken".into(),
            suggestion: None,
        };
        assert_eq!(taken.category_at(ProvisioningStatus::Validating), ErrorCategory::PreFlight);
        assert_eq!(
            taken.category_at(ProvisioningStatus::CreatingTenantRecord),
            ErrorCategory::Transactional
        );

        let internal = ProvisioningError::Internal("store offline".into());
        assert_eq!(internal.category_at(ProvisioningStatus::Validating), ErrorCategory::PreFlight);
        assert_eq!(internal.category_at(ProvisioningStatus::LinkingIdentity), ErrorCategory::CrossSystem);
    }

    #[test]
    fn test_invariant_category_ignores_step() {
        let err = ProvisioningError::IntegrityVerificationFailed("link mismatch".into());
        assert_eq!(err.category_at(ProvisioningStatus::Validating), ErrorCategory::Invariant);
        assert_eq!(err.category_at(ProvisioningStatus::Verifying), ErrorCategory::Invariant);
        assert_eq!(ErrorCategory::Invariant.as_str(), "invariant");
    }

    #[test]
    fn test_body_includes_suggestion() {
        let request_id = Uuid::new_v4();
        let err = ProvisioningError::SlugUnavailable {
            slug: "acme-bistro".into(),
            reason: "already taken".into(),
            suggestion: Some("acme-bistro-2".into()),
        };
        let body = err.to_body(request_id);
        assert_eq!(body.code, ErrorCode::SlugUnavailable);
        assert_eq!(body.suggestion.as_deref(), Some("acme-bistro-2"));
        assert_eq!(body.request_id, request_id);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["suggestion"], "acme-bistro-2");
        assert_eq!(json["requestId"], request_id.to_string());
    }

    #[test]
    fn test_body_omits_missing_suggestion() {
        let body = ProvisioningError::Validation("bad".into()).to_body(Uuid::new_v4());
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("suggestion").is_none());
    }

    #[test]
    fn test_replayed_body_is_verbatim() {
        let original = ErrorBody {
            code: ErrorCode::EmailUnavailable,
            message: "Email is unavailable".into(),
            suggestion: None,
            request_id: Uuid::new_v4(),
        };
        let err = ProvisioningError::Replayed(original.clone());
        assert_eq!(err.to_body(Uuid::new_v4()), original);
        assert_eq!(err.code(), ErrorCode::EmailUnavailable);
    }

    #[test]
    fn test_identity_error_mapping() {
        assert_eq!(
            ProvisioningError::from(IdentityError::EmailAlreadyExists).code(),
            ErrorCode::EmailUnavailable
        );
        assert_eq!(
            ProvisioningError::from(IdentityError::ProviderUnavailable("down".into())).code(),
            ErrorCode::IdentityProviderUnavailable
        );
    }
}
