//! Delivery attempt entity.
//!
//! One row per HTTP dispatch, persisted as evidence before the delivery's
//! status transitions so observability never loses an attempt. Request and
//! response bodies are stored as capped snippets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use courier_core::{DeliveryAttemptId, EventDeliveryId, ProjectId};

/// Maximum stored request/response body snippet, in bytes.
pub const MAX_BODY_SNIPPET_BYTES: usize = 2048;

/// Snapshot of the outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Snapshot of the subscriber's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Database entity for a single dispatch attempt.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: DeliveryAttemptId,
    pub event_delivery_id: EventDeliveryId,
    pub project_id: ProjectId,
    pub request: Json<AttemptRequest>,
    pub response: Option<Json<AttemptResponse>>,
    pub error: Option<String>,
    pub ip_address: Option<String>,
    pub http_status: Option<i16>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Persist an attempt row.
    pub async fn create(pool: &PgPool, attempt: &DeliveryAttempt) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                id, event_delivery_id, project_id, request, response,
                error, ip_address, http_status, started_at, ended_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.event_delivery_id)
        .bind(attempt.project_id)
        .bind(&attempt.request)
        .bind(&attempt.response)
        .bind(&attempt.error)
        .bind(&attempt.ip_address)
        .bind(attempt.http_status)
        .bind(attempt.started_at)
        .bind(attempt.ended_at)
        .execute(pool)
        .await?;

        Ok(())
    }
}

/// Truncate a body to the stored snippet budget on a UTF-8 boundary.
#[must_use]
pub fn body_snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= MAX_BODY_SNIPPET_BYTES {
        return text.into_owned();
    }
    let mut end = MAX_BODY_SNIPPET_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
