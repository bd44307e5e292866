//! Tenant model and database operations
//!
//! A tenant is one restaurant account. It is created in the `provisioning`
//! state without an owner and becomes `active` only when the owner identity has
//! been linked in the same transaction that sets `owner_id`.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE tenants (
//!     id UUID PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     slug TEXT NOT NULL,
//!     owner_id UUID REFERENCES owners(id),
//!     status TEXT NOT NULL DEFAULT 'provisioning',
//!     timezone TEXT NOT NULL,
//!     currency TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     archived_at TIMESTAMPTZ,
//!     CONSTRAINT tenants_owner_id_key UNIQUE (owner_id),
//!     CONSTRAINT tenants_owner_required CHECK (status = 'provisioning' OR owner_id IS NOT NULL)
//! );
//! CREATE UNIQUE INDEX tenants_slug_key ON tenants (slug);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgExecutor;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

/// Lifecycle status of a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Created by the provisioning saga, owner not linked yet
    Provisioning,

    /// Owner linked and verified
    Active,

    /// Temporarily disabled by an operator
    Suspended,

    /// Permanently retired; its slug stays reserved
    Archived,
}

impl TenantStatus {
    /// Converts status to string for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Provisioning => "provisioning",
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Archived => "archived",
        }
    }

    /// Whether this status is one of the transient pre-active states
    ///
    /// Only tenants in a transient state may have a null `owner_id`.
    pub fn is_transient(&self) -> bool {
        matches!(self, TenantStatus::Provisioning)
    }

    /// Checks whether an operator lifecycle change is legal
    ///
    /// `provisioning -> active` is not listed here: only the linking
    /// transaction of the provisioning saga performs it.
    pub fn can_transition_to(&self, next: TenantStatus) -> bool {
        matches!(
            (self, next),
            (TenantStatus::Active, TenantStatus::Suspended)
                | (TenantStatus::Suspended, TenantStatus::Active)
                | (TenantStatus::Active, TenantStatus::Archived)
                | (TenantStatus::Suspended, TenantStatus::Archived)
        )
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(TenantStatus::Provisioning),
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "archived" => Ok(TenantStatus::Archived),
            other => Err(ParseEnumError::new("tenant status", other)),
        }
    }
}

impl TryFrom<String> for TenantStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Tenant model representing one restaurant account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    /// Unique tenant ID
    pub id: Uuid,

    /// Display name of the restaurant
    pub name: String,

    /// URL-safe identifier, unique across all tenants
    pub slug: String,

    /// Owner identity; `None` only while provisioning
    pub owner_id: Option<Uuid>,

    /// Lifecycle status
    #[sqlx(try_from = "String")]
    pub status: TenantStatus,

    /// IANA timezone name (e.g. "Europe/Paris")
    pub timezone: String,

    /// ISO 4217 currency code (e.g. "EUR")
    pub currency: String,

    /// When the tenant was created
    pub created_at: DateTime<Utc>,

    /// When the tenant was last updated
    pub updated_at: DateTime<Utc>,

    /// When the tenant was archived
    pub archived_at: Option<DateTime<Utc>>,
}

/// Input for creating a provisional tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenant {
    /// Pre-generated tenant ID
    pub id: Uuid,

    /// Display name
    pub name: String,

    /// Validated slug
    pub slug: String,

    /// IANA timezone name
    pub timezone: String,

    /// ISO 4217 currency code
    pub currency: String,
}

impl Tenant {
    /// Builds the in-memory record for a freshly inserted provisional tenant
    pub fn provisional(data: NewTenant, now: DateTime<Utc>) -> Self {
        Self {
            id: data.id,
            name: data.name,
            slug: data.slug,
            owner_id: None,
            status: TenantStatus::Provisioning,
            timezone: data.timezone,
            currency: data.currency,
            created_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// Inserts a tenant in the `provisioning` state with no owner
    ///
    /// # Errors
    ///
    /// Returns a database error carrying the `tenants_slug_key` constraint
    /// when the slug is already used by another tenant.
    pub async fn insert_provisional<'e, E>(executor: E, data: &NewTenant) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Tenant>(
            r#"
            INSERT INTO tenants (id, name, slug, status, timezone, currency)
            VALUES ($1, $2, $3, 'provisioning', $4, $5)
            RETURNING id, name, slug, owner_id, status, timezone, currency,
                      created_at, updated_at, archived_at
            "#,
        )
        .bind(data.id)
        .bind(&data.name)
        .bind(&data.slug)
        .bind(&data.timezone)
        .bind(&data.currency)
        .fetch_one(executor)
        .await
    }

    /// Finds a tenant by ID
    pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, name, slug, owner_id, status, timezone, currency,
                   created_at, updated_at, archived_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    /// Finds the tenant holding a slug, archived or not
    pub async fn find_by_slug<'e, E>(executor: E, slug: &str) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, name, slug, owner_id, status, timezone, currency,
                   created_at, updated_at, archived_at
            FROM tenants
            WHERE slug = $1
            "#,
        )
        .bind(slug)
        .fetch_optional(executor)
        .await
    }

    /// Sets the real owner and flips the tenant to `active`
    ///
    /// Only matches tenants still in `provisioning`, so a second linking
    /// attempt returns `None` instead of re-pointing the tenant.
    pub async fn activate_with_owner<'e, E>(
        executor: E,
        id: Uuid,
        owner_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Tenant>(
            r#"
            UPDATE tenants
            SET owner_id = $2, status = 'active', updated_at = NOW()
            WHERE id = $1 AND status = 'provisioning'
            RETURNING id, name, slug, owner_id, status, timezone, currency,
                      created_at, updated_at, archived_at
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .fetch_optional(executor)
        .await
    }

    /// Moves a tenant between operator lifecycle states
    ///
    /// The update is guarded by the expected current status; `None` means the
    /// tenant does not exist or was concurrently changed.
    pub async fn update_status<'e, E>(
        executor: E,
        id: Uuid,
        from: TenantStatus,
        to: TenantStatus,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query_as::<_, Tenant>(
            r#"
            UPDATE tenants
            SET status = $3,
                updated_at = NOW(),
                archived_at = CASE WHEN $3 = 'archived' THEN NOW() ELSE archived_at END
            WHERE id = $1 AND status = $2
            RETURNING id, name, slug, owner_id, status, timezone, currency,
                      created_at, updated_at, archived_at
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(executor)
        .await
    }

    /// Deletes a tenant created by a given provisioning request
    ///
    /// Used by saga compensation. The tenant must still carry the ownership
    /// link written by that request, so compensation can never remove a
    /// tenant another attempt created. The link goes with it (cascade).
    pub async fn delete_created_by<'e, E>(
        executor: E,
        id: Uuid,
        request_id: Uuid,
    ) -> Result<bool, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            DELETE FROM tenants t
            USING tenant_owner_links l
            WHERE t.id = $1
              AND l.tenant_id = t.id
              AND l.request_id = $2
              AND t.status IN ('provisioning', 'active')
            "#,
        )
        .bind(id)
        .bind(request_id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
