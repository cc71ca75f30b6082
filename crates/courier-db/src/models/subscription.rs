//! Subscription entity.
//!
//! A subscription binds an event filter (source + type patterns) to an
//! endpoint and may override the project's retry strategy, rate limit and
//! alerting, and add custom headers to the outbound request.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use courier_core::{EndpointId, ProjectId, SubscriptionId};

use super::project::{RateLimitConfiguration, StrategyConfiguration};

/// Event filter: which events reach this subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfiguration {
    /// Source reference patterns. Empty matches any source.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Event type patterns, e.g. `invoice.*`. Empty matches any type.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Optional body filter expression, evaluated by the ingest path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
}

/// Operator alerting thresholds for a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfiguration {
    /// Consecutive failures before alerting.
    pub count: u32,
    /// Alert threshold window, e.g. "1h".
    pub threshold: String,
}

/// Database entity for a subscription.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub project_id: ProjectId,
    pub endpoint_id: EndpointId,
    pub name: String,
    pub filter_config: Json<FilterConfiguration>,
    pub retry_config: Option<Json<StrategyConfiguration>>,
    pub rate_limit_config: Option<Json<RateLimitConfiguration>>,
    pub alert_config: Option<Json<AlertConfiguration>>,
    pub custom_headers: Option<Json<HashMap<String, String>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Find a subscription by project and id.
    pub async fn find_by_id(
        pool: &PgPool,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE project_id = $1 AND id = $2
            "#,
        )
        .bind(project_id)
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}
