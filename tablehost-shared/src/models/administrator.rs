//! Platform administrator directory
//!
//! Administrators are staff identities of the same identity provider as
//! owners, stored in their own table. Lookups here are always live queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use uuid::Uuid;

/// Administrator row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Administrator {
    /// Identity provider user id
    pub id: Uuid,

    /// Normalized email
    pub email: String,

    pub name: String,

    pub created_at: DateTime<Utc>,
}

impl Administrator {
    /// Registers an administrator
    ///
    /// # Errors
    ///
    /// Fails with a unique violation when the email is taken by another
    /// administrator or by an owner (`administrators_admin_guard` trigger).
    pub async fn insert<'e, E>(
        executor: E,
        id: Uuid,
        email: &str,
        name: &str,
    ) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Administrator>(
            r#"
            INSERT INTO administrators (id, email, name)
            VALUES ($1, $2, $3)
            RETURNING id, email, name, created_at
            "#,
        )
        .bind(id)
        .bind(email)
        .bind(name)
        .fetch_one(executor)
        .await
    }

    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Administrator>(
            "SELECT id, email, name, created_at FROM administrators WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_email<'e, E>(executor: E, email: &str) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Administrator>(
            "SELECT id, email, name, created_at FROM administrators WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(executor)
        .await
    }
}
