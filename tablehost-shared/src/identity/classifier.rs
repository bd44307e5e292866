//! Administrator/owner classification
//!
//! The single place that decides whether an identity is a platform
//! administrator. Every code path that mutates owner credentials goes
//! through [`IdentityClassifier::owner_target`], and the identity provider
//! only accepts the [`OwnerCredentialTarget`] it returns.
//!
//! Classification is a live query against the administrator directory on
//! every call. Nothing is cached.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::error::ProvisioningError;
use crate::models::Administrator;
use crate::store::{AdministratorDirectory, StoreError};

/// Proof that an identity was classified as a non-administrator
///
/// Only the classifier can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerCredentialTarget {
    identity_id: Uuid,
}

impl OwnerCredentialTarget {
    pub fn identity_id(&self) -> Uuid {
        self.identity_id
    }
}

/// Outcome of a classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityClass {
    Administrator(Administrator),
    Owner(OwnerCredentialTarget),
}

#[async_trait]
pub trait IdentityClassifier: Send + Sync {
    async fn classify(&self, identity_id: Uuid) -> Result<IdentityClass, StoreError>;

    async fn is_administrator(&self, identity_id: Uuid) -> Result<bool, StoreError> {
        Ok(matches!(self.classify(identity_id).await?, IdentityClass::Administrator(_)))
    }

    /// Classifies `identity_id` and refuses administrators
    ///
    /// An administrator here is an invariant violation and is logged at
    /// error level.
    async fn owner_target(&self, identity_id: Uuid) -> Result<OwnerCredentialTarget, ProvisioningError> {
        match self.classify(identity_id).await? {
            IdentityClass::Owner(target) => Ok(target),
            IdentityClass::Administrator(admin) => {
                error!(
                    identity_id = %identity_id,
                    admin_email = %admin.email,
                    "Refusing credential mutation of an administrator identity"
                );
                Err(ProvisioningError::AdminCredentialProtectionViolation { identity_id })
            }
        }
    }
}

/// Classifier backed by the administrator directory
pub struct DirectoryClassifier<D: AdministratorDirectory + ?Sized> {
    directory: Arc<D>,
}

impl<D: AdministratorDirectory + ?Sized> DirectoryClassifier<D> {
    pub fn new(directory: Arc<D>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl<D: AdministratorDirectory + ?Sized> IdentityClassifier for DirectoryClassifier<D> {
    async fn classify(&self, identity_id: Uuid) -> Result<IdentityClass, StoreError> {
        match self.directory.find_administrator(identity_id).await? {
            Some(admin) => Ok(IdentityClass::Administrator(admin)),
            None => Ok(IdentityClass::Owner(OwnerCredentialTarget { identity_id })),
        }
    }
}
