//! Database models for Tablehost
//!
//! This module contains the persistent records of the provisioning engine and
//! their Postgres queries. Query functions take any `PgExecutor`, so the same
//! function runs against the pool or inside a transaction.
//!
//! # Models
//!
//! - `tenant`: Restaurant accounts
//! - `owner`: Owner identity profiles (mirror of the identity provider user)
//! - `owner_link`: Ownership linkage row claimed during provisioning
//! - `administrator`: Platform staff identities
//! - `provisioning_request`: Idempotency + audit unit of a provisioning attempt
//! - `audit_entry`: Append-only trace of every orchestration step

pub mod administrator;
pub mod audit_entry;
pub mod owner;
pub mod owner_link;
pub mod provisioning_request;
pub mod tenant;

pub use administrator::Administrator;
pub use audit_entry::{AuditEntry, AuditOperation, AuditOutcome, NewAuditEntry};
pub use owner::{NewOwner, Owner, OwnerRole};
pub use owner_link::{LinkState, OwnerLink};
pub use provisioning_request::{NewProvisioningRequest, ProvisioningRequest, ProvisioningStatus};
pub use tenant::{NewTenant, Tenant, TenantStatus};

/// Error returned when a stored enum column holds an unknown value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown {kind} value: {value}")]
pub struct ParseEnumError {
    /// Name of the enum being parsed
    pub kind: &'static str,

    /// Offending value
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Normalizes an email address for storage and comparison
///
/// Emails are compared case-insensitively everywhere (the database indexes
/// use `lower(email)`), so every code path normalizes before it compares.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Owner1@Example.COM "), "owner1@example.com");
        assert_eq!(normalize_email("plain@example.com"), "plain@example.com");
    }

    #[test]
    fn test_parse_enum_error_display() {
        let err = ParseEnumError::new("tenant status", "deleted");
        assert_eq!(err.to_string(), "Unknown tenant status value: deleted");
    }
}
