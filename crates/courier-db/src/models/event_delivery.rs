//! Event delivery entity.
//!
//! One `EventDelivery` is one (event, endpoint) pairing with its own retry
//! budget. The processor owns every status transition after ingest creates
//! the row as `scheduled`; `success`, `failure` and `discarded` are
//! terminal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use courier_core::{EndpointId, EventDeliveryId, EventId, ProjectId, SubscriptionId};

use super::project::StrategyKind;

/// Delivery guarantee for a delivery.
///
/// A tagged enum rather than a boolean so that future modes (e.g.
/// exactly-once with dedupe) extend cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delivery_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Retried per the configured strategy until the budget is exhausted.
    AtLeastOnce,
    /// Dispatched once; any failure is final.
    AtMostOnce,
}

/// Lifecycle status of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventDeliveryStatus {
    Scheduled,
    Processing,
    Retry,
    Success,
    Failure,
    Discarded,
}

impl EventDeliveryStatus {
    /// Terminal statuses never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Discarded)
    }
}

/// Retry bookkeeping and the payload to send, stored as JSONB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// The event payload as structured JSON.
    pub data: serde_json::Value,
    /// The exact bytes to send, as stored at ingest.
    pub raw: String,
    /// Attempts executed so far.
    pub num_trials: u64,
    pub retry_limit: u64,
    /// Base retry interval in seconds.
    pub interval_seconds: u64,
    pub strategy: StrategyKind,
    /// Cap for exponential backoff, in seconds.
    #[serde(default)]
    pub max_retry_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_send_time: Option<DateTime<Utc>>,
}

/// Database entity for an event delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventDelivery {
    pub id: EventDeliveryId,
    pub project_id: ProjectId,
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    pub subscription_id: Option<SubscriptionId>,
    pub delivery_mode: DeliveryMode,
    pub status: EventDeliveryStatus,
    pub metadata: Json<DeliveryMetadata>,
    pub headers: Option<Json<HashMap<String, String>>>,
    /// Last human-readable failure reason.
    pub description: String,
    /// Extra query parameters merged into the endpoint URL at dispatch.
    pub url_query_params: String,
    pub idempotency_key: Option<String>,
    pub latency_seconds: f64,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventDelivery {
    /// The retry limit the processor must honor: at-most-once deliveries
    /// never retry regardless of the configured limit.
    #[must_use]
    pub fn effective_retry_limit(&self) -> u64 {
        match self.delivery_mode {
            DeliveryMode::AtLeastOnce => self.metadata.retry_limit,
            DeliveryMode::AtMostOnce => 0,
        }
    }

    /// Load a delivery without joining related rows. This is the hot-path
    /// projection the processor uses.
    pub async fn find_by_id_slim(
        pool: &PgPool,
        project_id: ProjectId,
        id: EventDeliveryId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM event_deliveries
            WHERE project_id = $1 AND id = $2
            "#,
        )
        .bind(project_id)
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Update only the status of a delivery.
    pub async fn update_status(
        pool: &PgPool,
        project_id: ProjectId,
        id: EventDeliveryId,
        status: EventDeliveryStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE event_deliveries
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

    /// Commit status, metadata, description and latency in one statement so
    /// trial counts are never lost between concurrent workers. The row lock
    /// taken by the UPDATE serializes writers on the delivery id.
    pub async fn update_metadata(
        pool: &PgPool,
        project_id: ProjectId,
        delivery: &EventDelivery,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE event_deliveries
            SET
                status = $3,
                metadata = $4,
                description = $5,
                latency_seconds = $6,
                updated_at = NOW()
            WHERE project_id = $1 AND id = $2
            "#,
        )
        .bind(project_id)
        .bind(delivery.id)
        .bind(delivery.status)
        .bind(&delivery.metadata)
        .bind(&delivery.description)
        .bind(delivery.latency_seconds)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Reclaim deliveries stuck in the given status for longer than the
    /// cutoff, resetting them to `scheduled` so the reaper can re-enqueue
    /// them. `FOR UPDATE SKIP LOCKED` keeps concurrent reapers from
    /// colliding on the same rows.
    pub async fn find_stuck_by_status(
        pool: &PgPool,
        status: EventDeliveryStatus,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            UPDATE event_deliveries
            SET status = 'scheduled', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM event_deliveries
                WHERE status = $1 AND updated_at < $2
                ORDER BY updated_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(status)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
