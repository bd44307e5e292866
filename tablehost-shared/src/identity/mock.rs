//! In-memory identity provider
//!
//! Behaves like the real provider (unique emails, idempotent delete, Argon2
//! password storage) and records every call, so tests can assert both on the
//! resulting accounts and on whether the provider was touched at all.
//!
//! # Fault injection
//!
//! - [`MockIdentityProvider::fail_next_creates`]: creates fail with
//!   `ProviderUnavailable` before doing anything
//! - [`MockIdentityProvider::lose_next_create_responses`]: creates succeed but
//!   the caller sees `ProviderUnavailable` (an ambiguous timeout)
//! - [`MockIdentityProvider::fail_next_deletes`]: deletes fail
//! - [`MockIdentityProvider::miss_next_email_lookups`]: email lookups do not
//!   see an account that exists (a listing that has not caught up)
//! - [`MockIdentityProvider::set_available`]: the whole provider is down

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::classifier::OwnerCredentialTarget;
use super::provider::{
    CreateUser, CreatedIdentity, CredentialChange, IdentityError, IdentityProvider, IdentityUser,
};
use crate::auth::password::{hash_password, verify_password};
use crate::models::normalize_email;

#[derive(Debug, Clone)]
struct MockUser {
    id: Uuid,
    email: String,
    password_hash: String,
    request_id: Option<Uuid>,
}

impl MockUser {
    fn to_identity(&self) -> IdentityUser {
        IdentityUser {
            id: self.id,
            email: self.email.clone(),
            request_id: self.request_id,
        }
    }
}

/// Per-operation call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u32,
    pub delete: u32,
    pub update: u32,
    pub find: u32,
}

impl CallCounts {
    pub fn total(&self) -> u32 {
        self.create + self.delete + self.update + self.find
    }

    /// Calls that change provider state
    pub fn mutations(&self) -> u32 {
        self.create + self.delete + self.update
    }
}

#[derive(Debug)]
struct State {
    users: HashMap<Uuid, MockUser>,
    calls: CallCounts,
    available: bool,
    failing_creates: u32,
    lost_create_responses: u32,
    failing_deletes: u32,
    missed_email_lookups: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            calls: CallCounts::default(),
            available: true,
            failing_creates: 0,
            lost_create_responses: 0,
            failing_deletes: 0,
            missed_email_lookups: 0,
        }
    }
}

impl State {
    fn ensure_available(&self) -> Result<(), IdentityError> {
        if self.available {
            Ok(())
        } else {
            Err(IdentityError::ProviderUnavailable("provider is down".to_string()))
        }
    }

    fn user_by_email(&self, email: &str) -> Option<&MockUser> {
        let email = normalize_email(email);
        self.users.values().find(|u| u.email == email)
    }
}

/// Identity provider kept in process memory
#[derive(Debug, Default)]
pub struct MockIdentityProvider {
    state: Mutex<State>,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account that exists outside of provisioning
    pub async fn insert_user(&self, id: Uuid, email: &str, password: &str) -> Result<(), IdentityError> {
        let password_hash =
            hash_password(password).map_err(|e| IdentityError::InvalidRequest(e.to_string()))?;
        let mut state = self.state.lock().await;
        state.users.insert(
            id,
            MockUser {
                id,
                email: normalize_email(email),
                password_hash,
                request_id: None,
            },
        );
        Ok(())
    }

    pub async fn fail_next_creates(&self, times: u32) {
        self.state.lock().await.failing_creates = times;
    }

    pub async fn lose_next_create_responses(&self, times: u32) {
        self.state.lock().await.lost_create_responses = times;
    }

    pub async fn fail_next_deletes(&self, times: u32) {
        self.state.lock().await.failing_deletes = times;
    }

    /// Only lookups that would have found an account count down
    pub async fn miss_next_email_lookups(&self, times: u32) {
        self.state.lock().await.missed_email_lookups = times;
    }

    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users.len()
    }

    pub async fn user(&self, id: Uuid) -> Option<IdentityUser> {
        self.state.lock().await.users.get(&id).map(MockUser::to_identity)
    }

    /// Checks a password against the stored hash
    pub async fn password_matches(&self, id: Uuid, password: &str) -> bool {
        let hash = match self.state.lock().await.users.get(&id) {
            Some(user) => user.password_hash.clone(),
            None => return false,
        };
        verify_password(password, &hash).unwrap_or(false)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn create_user(&self, request: &CreateUser) -> Result<CreatedIdentity, IdentityError> {
        let email = normalize_email(&request.email);
        {
            let mut state = self.state.lock().await;
            state.calls.create += 1;
            state.ensure_available()?;

            if state.failing_creates > 0 {
                state.failing_creates -= 1;
                return Err(IdentityError::ProviderUnavailable("injected create failure".to_string()));
            }
            if state.user_by_email(&email).is_some() {
                return Err(IdentityError::EmailAlreadyExists);
            }
        }

        // Hash outside the lock; Argon2 is deliberately slow.
        let password_hash =
            hash_password(&request.password).map_err(|e| IdentityError::InvalidRequest(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.user_by_email(&email).is_some() {
            return Err(IdentityError::EmailAlreadyExists);
        }

        let id = Uuid::new_v4();
        state.users.insert(
            id,
            MockUser {
                id,
                email,
                password_hash,
                request_id: Some(request.request_id),
            },
        );
        debug!(identity_id = %id, "Mock identity created");

        if state.lost_create_responses > 0 {
            state.lost_create_responses -= 1;
            return Err(IdentityError::ProviderUnavailable("injected timeout after create".to_string()));
        }

        Ok(CreatedIdentity { id, created: true })
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), IdentityError> {
        let mut state = self.state.lock().await;
        state.calls.delete += 1;
        state.ensure_available()?;

        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(IdentityError::ProviderUnavailable("injected delete failure".to_string()));
        }

        state.users.remove(&id);
        Ok(())
    }

    async fn update_credentials(
        &self,
        target: &OwnerCredentialTarget,
        change: &CredentialChange,
    ) -> Result<IdentityUser, IdentityError> {
        let password_hash = match &change.password {
            Some(password) => {
                Some(hash_password(password).map_err(|e| IdentityError::InvalidRequest(e.to_string()))?)
            }
            None => None,
        };

        let mut state = self.state.lock().await;
        state.calls.update += 1;
        state.ensure_available()?;

        let id = target.identity_id();
        if !state.users.contains_key(&id) {
            return Err(IdentityError::NotFound);
        }

        let email = change.email.as_deref().map(normalize_email);
        if let Some(email) = &email {
            if state.user_by_email(email).map(|u| u.id != id).unwrap_or(false) {
                return Err(IdentityError::EmailAlreadyExists);
            }
        }

        let user = state.users.get_mut(&id).ok_or(IdentityError::NotFound)?;
        if let Some(email) = email {
            user.email = email;
        }
        if let Some(hash) = password_hash {
            user.password_hash = hash;
        }

        Ok(user.to_identity())
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<IdentityUser>, IdentityError> {
        let mut state = self.state.lock().await;
        state.calls.find += 1;
        state.ensure_available()?;

        Ok(state.users.get(&id).map(MockUser::to_identity))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError> {
        let mut state = self.state.lock().await;
        state.calls.find += 1;
        state.ensure_available()?;

        let found = state.user_by_email(email).map(MockUser::to_identity);
        if found.is_some() && state.missed_email_lookups > 0 {
            state.missed_email_lookups -= 1;
            return Ok(None);
        }
        Ok(found)
    }
}
