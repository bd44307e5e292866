//! HTTP client for a GoTrue-style admin API
//!
//! | Operation | Request |
//! |---|---|
//! | create | `POST /admin/users` |
//! | find | `GET /admin/users/{id}` |
//! | find by email | `GET /admin/users?email=&page=&per_page=` |
//! | update | `PUT /admin/users/{id}` |
//! | delete | `DELETE /admin/users/{id}` |
//!
//! Status mapping: 409/422 on create or update mean the email is taken,
//! 404 means not found (success for delete), 400 is a rejected payload, and
//! 5xx, timeouts and transport errors mean the provider is unavailable.
//!
//! Providers that ignore the `email` filter return the full user list, so
//! the lookup walks pages until it finds the address or reaches a short page.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::future::Future;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::classifier::OwnerCredentialTarget;
use super::provider::{
    CreateUser, CreatedIdentity, CredentialChange, IdentityError, IdentityProvider, IdentityUser,
};

/// Connection settings of the identity provider
#[derive(Debug, Clone)]
pub struct HttpIdentityConfig {
    /// Base URL of the admin API (e.g. "https://auth.example.com/auth/v1")
    pub base_url: String,

    /// Service-role key sent as bearer token
    pub service_key: String,

    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct CreateUserBody<'a> {
    email: &'a str,
    password: &'a str,
    email_confirm: bool,
    user_metadata: UserMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provisioning_request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateUserBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: Uuid,
    #[serde(default)]
    email: String,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

impl From<UserResponse> for IdentityUser {
    fn from(user: UserResponse) -> Self {
        IdentityUser {
            id: user.id,
            email: user.email,
            request_id: user.user_metadata.and_then(|m| m.provisioning_request_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserListResponse {
    #[serde(default)]
    users: Vec<UserResponse>,
}

/// Users requested per page when searching by email
const USERS_PER_PAGE: usize = 200;

/// Upper bound on pages read by one email lookup
const MAX_USER_PAGES: u32 = 50;

/// Reads pages from 1 until `wanted` shows up or a page comes back short
async fn scan_user_pages<F, Fut>(wanted: &str, mut fetch: F) -> Result<Option<IdentityUser>, IdentityError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<UserResponse>, IdentityError>>,
{
    let wanted = wanted.trim().to_lowercase();
    for page in 1..=MAX_USER_PAGES {
        let users = fetch(page).await?;
        let last = users.len() < USERS_PER_PAGE;
        if let Some(user) = users.into_iter().find(|u| u.email.to_lowercase() == wanted) {
            return Ok(Some(user.into()));
        }
        if last {
            return Ok(None);
        }
    }

    warn!(pages = MAX_USER_PAGES, "Email lookup stopped before the end of the user list");
    Err(IdentityError::ProviderUnavailable(
        "user list too long to search by email".to_string(),
    ))
}

/// Identity provider reached over HTTP
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpIdentityProvider {
    pub fn new(config: HttpIdentityConfig) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IdentityError::ProviderUnavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn list_users_page(&self, email: &str, page: u32) -> Result<Vec<UserResponse>, IdentityError> {
        let query = [
            ("email", email.to_string()),
            ("page", page.to_string()),
            ("per_page", USERS_PER_PAGE.to_string()),
        ];
        let response = self.send(self.client.get(self.url("/admin/users")).query(&query)).await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let list = response
            .json::<UserListResponse>()
            .await
            .map_err(|e| IdentityError::ProviderUnavailable(format!("Invalid user list response: {e}")))?;
        debug!(page, users = list.users.len(), "Read identity provider user page");
        Ok(list.users)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, IdentityError> {
        self.authorize(request).send().await.map_err(|e| {
            warn!(error = %e, "Identity provider request failed");
            IdentityError::ProviderUnavailable(e.to_string())
        })
    }

    /// Maps a non-success status into an error
    async fn error_for(response: reqwest::Response) -> IdentityError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        status_error(status, body)
    }

    async fn parse_user(response: reqwest::Response) -> Result<IdentityUser, IdentityError> {
        response
            .json::<UserResponse>()
            .await
            .map(IdentityUser::from)
            .map_err(|e| IdentityError::ProviderUnavailable(format!("Invalid user response: {e}")))
    }
}

fn status_error(status: StatusCode, body: String) -> IdentityError {
    match status {
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => IdentityError::EmailAlreadyExists,
        StatusCode::NOT_FOUND => IdentityError::NotFound,
        StatusCode::BAD_REQUEST => IdentityError::InvalidRequest(body),
        _ => IdentityError::ProviderUnavailable(format!("HTTP {status}: {body}")),
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn create_user(&self, request: &CreateUser) -> Result<CreatedIdentity, IdentityError> {
        let body = CreateUserBody {
            email: &request.email,
            password: &request.password,
            email_confirm: true,
            user_metadata: UserMetadata {
                provisioning_request_id: Some(request.request_id),
                role: Some("tenant_owner".to_string()),
            },
        };

        let response = self.send(self.client.post(self.url("/admin/users")).json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let user = Self::parse_user(response).await?;
        debug!(identity_id = %user.id, "Identity created");
        Ok(CreatedIdentity { id: user.id, created: true })
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), IdentityError> {
        let response = self
            .send(self.client.delete(self.url(&format!("/admin/users/{id}"))))
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::error_for(response).await),
        }
    }

    async fn update_credentials(
        &self,
        target: &OwnerCredentialTarget,
        change: &CredentialChange,
    ) -> Result<IdentityUser, IdentityError> {
        let body = UpdateUserBody {
            email: change.email.as_deref(),
            password: change.password.as_deref(),
        };
        let path = format!("/admin/users/{}", target.identity_id());

        let response = self.send(self.client.put(self.url(&path)).json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Self::parse_user(response).await
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<IdentityUser>, IdentityError> {
        let response = self
            .send(self.client.get(self.url(&format!("/admin/users/{id}"))))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Self::parse_user(response).await.map(Some),
            _ => Err(Self::error_for(response).await),
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError> {
        scan_user_pages(email, |page| self.list_users_page(email, page)).await
    }
}
