//! Owner profile model
//!
//! The local mirror of an identity-provider user that owns exactly one tenant.
//! The row id is the identity provider's user id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

/// Role carried by an owner profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRole {
    TenantOwner,
}

impl OwnerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerRole::TenantOwner => "tenant_owner",
        }
    }
}

impl FromStr for OwnerRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant_owner" => Ok(OwnerRole::TenantOwner),
            other => Err(ParseEnumError::new("owner role", other)),
        }
    }
}

impl TryFrom<String> for OwnerRole {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Owner profile row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    /// Identity provider user id
    pub id: Uuid,

    /// Normalized email, unique across owners and administrators
    pub email: String,

    /// Optional display name
    pub name: Option<String>,

    #[sqlx(try_from = "String")]
    pub role: OwnerRole,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an owner profile
#[derive(Debug, Clone)]
pub struct NewOwner {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
}

impl Owner {
    /// Builds the in-memory record for a freshly inserted owner
    pub fn from_new(data: NewOwner, now: DateTime<Utc>) -> Self {
        Self {
            id: data.id,
            email: data.email,
            name: data.name,
            role: OwnerRole::TenantOwner,
            created_at: now,
            updated_at: now,
        }
    }

    /// Inserts an owner profile
    ///
    /// # Errors
    ///
    /// Fails with a unique violation on `owners_pkey`, `owners_email_key`, or
    /// one of the administrator-conflict constraints raised by the
    /// `owners_admin_guard` trigger.
    pub async fn insert<'e, E>(executor: E, data: &NewOwner) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Owner>(
            r#"
            INSERT INTO owners (id, email, name, role)
            VALUES ($1, $2, $3, 'tenant_owner')
            RETURNING id, email, name, role, created_at, updated_at
            "#,
        )
        .bind(data.id)
        .bind(&data.email)
        .bind(&data.name)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Owner>(
            "SELECT id, email, name, role, created_at, updated_at FROM owners WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    /// Case-insensitive lookup by email
    pub async fn find_by_email<'e, E>(executor: E, email: &str) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Owner>(
            r#"
            SELECT id, email, name, role, created_at, updated_at
            FROM owners
            WHERE lower(email) = lower($1)
            "#,
        )
        .bind(email)
        .fetch_optional(executor)
        .await
    }

    /// Rewrites the email mirror of an owner
    pub async fn update_email<'e, E>(
        executor: E,
        id: Uuid,
        email: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Owner>(
            r#"
            UPDATE owners
            SET email = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, email, name, role, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(email)
        .fetch_optional(executor)
        .await
    }

    /// Removes an owner profile that no tenant references any more
    ///
    /// Used when rolling back an attempt whose linking transaction committed.
    pub async fn delete_unreferenced<'e, E>(executor: E, id: Uuid) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            "DELETE FROM owners WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM tenants WHERE owner_id = $1)",
        )
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
