//! Delivery endpoint entity.
//!
//! An endpoint is the delivery target: a URL, the secrets used to sign
//! payloads for it, its lifecycle status and its rate-limit budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use courier_core::{EndpointId, ProjectId};

/// Lifecycle status of an endpoint.
///
/// Only `active` and `pending` endpoints receive deliveries. `pending` marks
/// a disabled endpoint that an operator has asked to re-try; a successful
/// delivery promotes it back to `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "endpoint_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Active,
    Inactive,
    Pending,
    Paused,
}

impl EndpointStatus {
    /// Whether a delivery may be dispatched to an endpoint in this status.
    #[must_use]
    pub fn is_deliverable(&self) -> bool {
        matches!(self, Self::Active | Self::Pending)
    }
}

/// One signing secret. Secrets are ordered on the endpoint: the first is
/// active, the rest are still accepted by subscribers during rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub value: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Secret {
    /// Whether the secret is still usable for signing at `now`.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Database entity for a delivery endpoint.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub project_id: ProjectId,
    pub name: String,
    pub url: String,
    pub status: EndpointStatus,
    pub secrets: Json<Vec<Secret>>,
    /// Requests allowed per rate-limit window. Zero means "use the project
    /// default".
    pub rate_limit: i32,
    /// Rate-limit window in seconds.
    pub rate_limit_duration: i32,
    pub advanced_signatures: bool,
    pub support_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Find an endpoint by project and id.
    pub async fn find_by_id(
        pool: &PgPool,
        project_id: ProjectId,
        id: EndpointId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM endpoints
            WHERE project_id = $1 AND id = $2
            "#,
        )
        .bind(project_id)
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Update the lifecycle status of an endpoint.
    pub async fn update_status(
        pool: &PgPool,
        project_id: ProjectId,
        id: EndpointId,
        status: EndpointStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE endpoints
            SET status = $3, updated_at = NOW()
            WHERE project_id = $1 AND id = $2
            "#,
        )
        .bind(project_id)
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Secrets usable for signing at `now`, preserving order.
    #[must_use]
    pub fn usable_secrets(&self, now: DateTime<Utc>) -> Vec<&Secret> {
        self.secrets.iter().filter(|s| s.is_usable(now)).collect()
    }
}
