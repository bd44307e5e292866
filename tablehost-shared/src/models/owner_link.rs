//! Tenant ownership link
//!
//! Written in the first provisioning transaction with `state = 'provisional'`
//! and the requested owner email, which claims that email at the database
//! level. The second transaction fills in `owner_id` and flips the state to
//! `linked`. Deleting the tenant cascades to its link.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Email claimed, identity not created yet
    Provisional,

    /// Identity linked to the tenant
    Linked,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Provisional => "provisional",
            LinkState::Linked => "linked",
        }
    }
}

impl FromStr for LinkState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisional" => Ok(LinkState::Provisional),
            "linked" => Ok(LinkState::Linked),
            other => Err(ParseEnumError::new("link state", other)),
        }
    }
}

impl TryFrom<String> for LinkState {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One row of `tenant_owner_links`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OwnerLink {
    pub tenant_id: Uuid,
    pub owner_email: String,
    pub owner_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub state: LinkState,
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OwnerLink {
    pub fn provisional(
        tenant_id: Uuid,
        owner_email: String,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            owner_email,
            owner_id: None,
            state: LinkState::Provisional,
            request_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Inserts a provisional link claiming `owner_email`
    ///
    /// # Errors
    ///
    /// Fails with a unique violation on `tenant_owner_links_email_key` when
    /// another tenant already claims the email.
    pub async fn insert_provisional<'e, E>(
        executor: E,
        tenant_id: Uuid,
        owner_email: &str,
        request_id: Uuid,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, OwnerLink>(
            r#"
            INSERT INTO tenant_owner_links (tenant_id, owner_email, state, request_id)
            VALUES ($1, $2, 'provisional', $3)
            RETURNING tenant_id, owner_email, owner_id, state, request_id, created_at, updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(owner_email)
        .bind(request_id)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_tenant<'e, E>(executor: E, tenant_id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, OwnerLink>(
            r#"
            SELECT tenant_id, owner_email, owner_id, state, request_id, created_at, updated_at
            FROM tenant_owner_links
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(executor)
        .await
    }

    /// Case-insensitive lookup of the link claiming an email
    pub async fn find_by_email<'e, E>(executor: E, email: &str) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, OwnerLink>(
            r#"
            SELECT tenant_id, owner_email, owner_id, state, request_id, created_at, updated_at
            FROM tenant_owner_links
            WHERE lower(owner_email) = lower($1)
            "#,
        )
        .bind(email)
        .fetch_optional(executor)
        .await
    }

    /// Fills in the owner id of a provisional link
    ///
    /// Returns `None` when the link is missing or already linked.
    pub async fn mark_linked<'e, E>(
        executor: E,
        tenant_id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, OwnerLink>(
            r#"
            UPDATE tenant_owner_links
            SET owner_id = $2, state = 'linked', updated_at = NOW()
            WHERE tenant_id = $1 AND state = 'provisional'
            RETURNING tenant_id, owner_email, owner_id, state, request_id, created_at, updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(owner_id)
        .fetch_optional(executor)
        .await
    }

    pub async fn update_email<'e, E>(
        executor: E,
        tenant_id: Uuid,
        owner_email: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, OwnerLink>(
            r#"
            UPDATE tenant_owner_links
            SET owner_email = $2, updated_at = NOW()
            WHERE tenant_id = $1
            RETURNING tenant_id, owner_email, owner_id, state, request_id, created_at, updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(owner_email)
        .fetch_optional(executor)
        .await
    }
}
