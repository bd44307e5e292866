//! Availability checks for slugs and owner emails
//!
//! These checks are advisory. Two requests can both pass them and race; the
//! unique constraints hit in the provisioning transaction decide the winner
//! and map to the same errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use validator::ValidateEmail;

use crate::error::ProvisioningError;
use crate::identity::{IdentityError, IdentityProvider};
use crate::models::{normalize_email, LinkState};
use crate::store::{Store, StoreError};

/// Slugs that collide with platform routes
pub const RESERVED_SLUGS: &[&str] = &[
    "admin", "api", "auth", "app", "assets", "billing", "dashboard", "docs", "health", "help",
    "login", "logout", "settings", "signup", "static", "status", "support", "www",
];

pub const SLUG_MIN_LENGTH: usize = 3;
pub const SLUG_MAX_LENGTH: usize = 50;

/// Where a conflicting email was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSource {
    Owner,
    Administrator,
    PendingProvisioning,
    IdentityProvider,
}

impl ConflictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSource::Owner => "owner",
            ConflictSource::Administrator => "administrator",
            ConflictSource::PendingProvisioning => "pending_provisioning",
            ConflictSource::IdentityProvider => "identity_provider",
        }
    }
}

impl fmt::Display for ConflictSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConflictSource::Owner => "an existing tenant owner",
            ConflictSource::Administrator => "a platform administrator",
            ConflictSource::PendingProvisioning => "a pending provisioning request",
            ConflictSource::IdentityProvider => "an existing identity provider account",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlugCheck {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailCheck {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicting_source: Option<ConflictSource>,
}

/// Why a slug cannot be used
#[derive(Debug, Clone, PartialEq, Eq)]
enum SlugProblem {
    /// The slug is malformed; no suggestion is possible
    Format(String),
    Reserved,
    Taken,
}

impl SlugProblem {
    fn reason(&self) -> String {
        match self {
            SlugProblem::Format(msg) => msg.clone(),
            SlugProblem::Reserved => "slug is reserved".to_string(),
            SlugProblem::Taken => "slug is already taken".to_string(),
        }
    }
}

/// Checks slug shape only: length, charset and hyphen placement
pub fn validate_slug_format(slug: &str) -> Result<(), String> {
    let len = slug.chars().count();
    if !(SLUG_MIN_LENGTH..=SLUG_MAX_LENGTH).contains(&len) {
        return Err(format!(
            "slug must be between {} and {} characters",
            SLUG_MIN_LENGTH, SLUG_MAX_LENGTH
        ));
    }
    if !slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return Err("slug may only contain lowercase letters, digits and hyphens".to_string());
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err("slug must not start or end with a hyphen".to_string());
    }
    Ok(())
}

pub fn is_reserved(slug: &str) -> bool {
    RESERVED_SLUGS.contains(&slug)
}

/// `<base>-<n>`, with the base cut so the result fits the length limit
fn suggestion_candidate(base: &str, n: usize) -> String {
    let suffix = format!("-{}", n);
    let room = SLUG_MAX_LENGTH.saturating_sub(suffix.len());
    let stem: String = base.chars().take(room).collect();
    format!("{}{}", stem.trim_end_matches('-'), suffix)
}

/// Slug and email availability
pub struct AvailabilityValidator {
    store: Arc<dyn Store>,
    identity: Arc<dyn IdentityProvider>,
    suggestion_attempts: usize,
}

impl AvailabilityValidator {
    pub fn new(store: Arc<dyn Store>, identity: Arc<dyn IdentityProvider>, suggestion_attempts: usize) -> Self {
        Self {
            store,
            identity,
            suggestion_attempts,
        }
    }

    async fn slug_problem(&self, slug: &str) -> Result<Option<SlugProblem>, StoreError> {
        if let Err(msg) = validate_slug_format(slug) {
            return Ok(Some(SlugProblem::Format(msg)));
        }
        if is_reserved(slug) {
            return Ok(Some(SlugProblem::Reserved));
        }
        if self.store.find_tenant_by_slug(slug).await?.is_some() {
            return Ok(Some(SlugProblem::Taken));
        }
        Ok(None)
    }

    /// Lowest free `<slug>-N` for N in 2..=attempts+1
    ///
    /// Concurrent callers can receive the same suggestion; whoever inserts
    /// first wins.
    pub async fn suggest(&self, slug: &str) -> Result<Option<String>, StoreError> {
        for n in 2..self.suggestion_attempts + 2 {
            let candidate = suggestion_candidate(slug, n);
            if self.slug_problem(&candidate).await?.is_none() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    pub async fn check_slug(&self, slug: &str) -> Result<SlugCheck, ProvisioningError> {
        match self.slug_problem(slug).await? {
            None => Ok(SlugCheck {
                available: true,
                reason: None,
                suggestion: None,
            }),
            Some(problem) => {
                let suggestion = match problem {
                    SlugProblem::Format(_) => None,
                    _ => self.suggest(slug).await?,
                };
                Ok(SlugCheck {
                    available: false,
                    reason: Some(problem.reason()),
                    suggestion,
                })
            }
        }
    }

    /// Fails unless the slug is usable
    ///
    /// Malformed slugs are a validation failure; reserved or taken slugs are
    /// `SLUG_UNAVAILABLE` with a suggestion when one is free.
    pub async fn require_slug(&self, slug: &str) -> Result<(), ProvisioningError> {
        match self.slug_problem(slug).await? {
            None => Ok(()),
            Some(SlugProblem::Format(msg)) => Err(ProvisioningError::Validation(msg)),
            Some(problem) => Err(self.slug_unavailable(slug, &problem.reason()).await),
        }
    }

    /// Builds the conflict error for a slug, suggestion included
    pub async fn slug_unavailable(&self, slug: &str, reason: &str) -> ProvisioningError {
        let suggestion = self.suggest(slug).await.unwrap_or_else(|e| {
            debug!(error = %e, "Slug suggestion lookup failed");
            None
        });
        ProvisioningError::SlugUnavailable {
            slug: slug.to_string(),
            reason: reason.to_string(),
            suggestion,
        }
    }

    async fn email_conflict(&self, email: &str) -> Result<Option<ConflictSource>, ProvisioningError> {
        if self.store.find_owner_by_email(email).await?.is_some() {
            return Ok(Some(ConflictSource::Owner));
        }
        if self.store.find_administrator_by_email(email).await?.is_some() {
            return Ok(Some(ConflictSource::Administrator));
        }
        if let Some(link) = self.store.find_link_by_email(email).await? {
            let source = match link.state {
                LinkState::Linked => ConflictSource::Owner,
                LinkState::Provisional => ConflictSource::PendingProvisioning,
            };
            return Ok(Some(source));
        }
        match self.identity.find_user_by_email(email).await {
            Ok(Some(_)) => Ok(Some(ConflictSource::IdentityProvider)),
            Ok(None) => Ok(None),
            Err(IdentityError::ProviderUnavailable(msg)) => {
                Err(ProvisioningError::IdentityProviderUnavailable(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn check_email(&self, email: &str) -> Result<EmailCheck, ProvisioningError> {
        let email = normalize_email(email);
        if !email.validate_email() {
            return Ok(EmailCheck {
                available: false,
                reason: Some("email address is not valid".to_string()),
                conflicting_source: None,
            });
        }

        Ok(match self.email_conflict(&email).await? {
            None => EmailCheck {
                available: true,
                reason: None,
                conflicting_source: None,
            },
            Some(source) => EmailCheck {
                available: false,
                reason: Some(format!("email is already used by {}", source)),
                conflicting_source: Some(source),
            },
        })
    }

    /// Fails unless the email is syntactically valid and unused everywhere
    pub async fn require_email(&self, email: &str) -> Result<(), ProvisioningError> {
        let email = normalize_email(email);
        if !email.validate_email() {
            return Err(ProvisioningError::Validation("email address is not valid".to_string()));
        }
        match self.email_conflict(&email).await? {
            None => Ok(()),
            Some(source_kind) => Err(ProvisioningError::EmailUnavailable { source_kind }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MockIdentityProvider;
    use crate::store::{AdministratorDirectory, MemoryStore};
    use uuid::Uuid;

    fn validator(store: Arc<MemoryStore>, identity: Arc<MockIdentityProvider>) -> AvailabilityValidator {
        AvailabilityValidator::new(store, identity, 10)
    }

    #[test]
    fn test_slug_format() {
        assert!(validate_slug_format("acme-bistro").is_ok());
        assert!(validate_slug_format("abc").is_ok());
        assert!(validate_slug_format("ab").is_err());
        assert!(validate_slug_format(&"a".repeat(51)).is_err());
        assert!(validate_slug_format("Acme").is_err());
        assert!(validate_slug_format("acme_bistro").is_err());
        assert!(validate_slug_format("-acme").is_err());
        assert!(validate_slug_format("acme-").is_err());
    }

    #[test]
    fn test_suggestion_fits_length_limit() {
        let base = "a".repeat(50);
        let candidate = suggestion_candidate(&base, 10);
        assert_eq!(candidate.len(), 50);
        assert!(candidate.ends_with("-10"));

        assert_eq!(suggestion_candidate("acme-bistro", 2), "acme-bistro-2");
    }

    #[test]
    fn test_suggestion_strips_dangling_hyphen() {
        let base = format!("{}-{}", "a".repeat(47), "bcd");
        let candidate = suggestion_candidate(&base, 2);
        assert!(!candidate.contains("--"));
        assert!(validate_slug_format(&candidate).is_ok());
    }

    #[tokio::test]
    async fn test_reserved_slug() {
        let v = validator(Arc::new(MemoryStore::new()), Arc::new(MockIdentityProvider::new()));

        let check = v.check_slug("admin").await.unwrap();
        assert!(!check.available);
        assert_eq!(check.suggestion.as_deref(), Some("admin-2"));

        let err = v.require_slug("api").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::SlugUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_malformed_slug_is_validation_error() {
        let v = validator(Arc::new(MemoryStore::new()), Arc::new(MockIdentityProvider::new()));

        let err = v.require_slug("No Spaces").await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Validation(_)));

        let check = v.check_slug("x").await.unwrap();
        assert!(!check.available);
        assert!(check.suggestion.is_none());
    }

    #[tokio::test]
    async fn test_free_email() {
        let v = validator(Arc::new(MemoryStore::new()), Arc::new(MockIdentityProvider::new()));
        let check = v.check_email("New@Example.com").await.unwrap();
        assert!(check.available);
    }

    #[tokio::test]
    async fn test_invalid_email() {
        let v = validator(Arc::new(MemoryStore::new()), Arc::new(MockIdentityProvider::new()));
        assert!(!v.check_email("not-an-email").await.unwrap().available);
        assert!(matches!(
            v.require_email("not-an-email").await,
            Err(ProvisioningError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_administrator_email_conflicts() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_administrator(Uuid::new_v4(), "staff@tablehost.io", "Staff")
            .await
            .unwrap();
        let v = validator(store, Arc::new(MockIdentityProvider::new()));

        let check = v.check_email("STAFF@tablehost.io").await.unwrap();
        assert_eq!(check.conflicting_source, Some(ConflictSource::Administrator));
    }

    #[tokio::test]
    async fn test_identity_provider_email_conflicts() {
        let identity = Arc::new(MockIdentityProvider::new());
        identity
            .insert_user(Uuid::new_v4(), "someone@example.com", "Some-Pass1")
            .await
            .unwrap();
        let v = validator(Arc::new(MemoryStore::new()), identity);

        let err = v.require_email("someone@example.com").await.unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::EmailUnavailable {
                source_kind: ConflictSource::IdentityProvider
            }
        );
    }

    #[tokio::test]
    async fn test_provider_outage_is_reported() {
        let identity = Arc::new(MockIdentityProvider::new());
        identity.set_available(false).await;
        let v = validator(Arc::new(MemoryStore::new()), identity);

        assert!(matches!(
            v.check_email("someone@example.com").await,
            Err(ProvisioningError::IdentityProviderUnavailable(_))
        ));
    }

    #[test]
    fn test_conflict_source_wire_names() {
        assert_eq!(
            serde_json::to_string(&ConflictSource::PendingProvisioning).unwrap(),
            "\"pending_provisioning\""
        );
        assert_eq!(ConflictSource::IdentityProvider.as_str(), "identity_provider");
    }
}
