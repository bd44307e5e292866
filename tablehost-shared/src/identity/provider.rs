//! Identity provider contract
//!
//! The external auth service owns the user record that an owner logs in
//! with. None of its calls take part in a database transaction, so every
//! call must be safe to retry and the caller compensates on failure.
//!
//! # Retry safety
//!
//! The provider accepts no idempotency token. A create whose response was
//! lost can be recognised afterwards because every user is created with the
//! provisioning correlation id in its metadata
//! ([`IdentityUser::request_id`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::classifier::OwnerCredentialTarget;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("An account with this email already exists")]
    EmailAlreadyExists,

    #[error("Identity not found")]
    NotFound,

    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider rejected the payload (e.g. its own password rules)
    #[error("Identity provider rejected the request: {0}")]
    InvalidRequest(String),
}

/// A user as the identity provider sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub id: Uuid,
    pub email: String,

    /// Correlation id of the provisioning attempt that created the user
    pub request_id: Option<Uuid>,
}

/// Input of `create_user`
#[derive(Debug, Clone)]
pub struct CreateUser {
    pub email: String,
    pub password: String,
    pub request_id: Uuid,
}

/// Result of `create_user`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedIdentity {
    pub id: Uuid,

    /// `false` when an existing account was adopted instead of created
    pub created: bool,
}

/// Fields of a credential change; `None` leaves the field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialChange {
    pub email: Option<String>,
    pub password: Option<String>,
}

impl CredentialChange {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.password.is_none()
    }
}

/// Narrow client of the external identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Creates a user
    ///
    /// Fails with `EmailAlreadyExists` when any account holds the email.
    async fn create_user(&self, request: &CreateUser) -> Result<CreatedIdentity, IdentityError>;

    /// Deletes a user; deleting a missing user succeeds
    async fn delete_user(&self, id: Uuid) -> Result<(), IdentityError>;

    /// Changes email and/or password of an owner identity
    ///
    /// Requires a target produced by the identity classifier, so this can
    /// never be called on an administrator.
    async fn update_credentials(
        &self,
        target: &OwnerCredentialTarget,
        change: &CredentialChange,
    ) -> Result<IdentityUser, IdentityError>;

    async fn find_user(&self, id: Uuid) -> Result<Option<IdentityUser>, IdentityError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError>;
}
