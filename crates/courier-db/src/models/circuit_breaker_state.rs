//! Persisted circuit breaker state.
//!
//! Breaker state lives outside the worker process so it survives restarts
//! and is shared between workers. The manager in `courier-delivery` owns
//! the transition rules; this row is just the durable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use courier_core::EndpointId;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "circuit_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, dispatches proceed.
    #[default]
    Closed,
    /// Circuit tripped, dispatches deferred until `open_until`.
    Open,
    /// Recovery probing, a fraction of dispatches is let through.
    HalfOpen,
}

/// Per-endpoint breaker record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub endpoint_id: EndpointId,
    pub state: CircuitState,
    pub consecutive_failures: i32,
    pub window_success_count: i32,
    pub window_failure_count: i32,
    pub window_started_at: DateTime<Utc>,
    pub open_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerState {
    /// A fresh closed record for an endpoint.
    #[must_use]
    pub fn closed(endpoint_id: EndpointId, now: DateTime<Utc>) -> Self {
        Self {
            endpoint_id,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            window_success_count: 0,
            window_failure_count: 0,
            window_started_at: now,
            open_until: None,
            updated_at: now,
        }
    }

    /// Samples observed in the current window.
    #[must_use]
    pub fn sample_count(&self) -> i32 {
        self.window_success_count + self.window_failure_count
    }

    /// Find the breaker record for an endpoint.
    pub async fn find_by_endpoint(
        pool: &PgPool,
        endpoint_id: EndpointId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM circuit_breaker_states
            WHERE endpoint_id = $1
            "#,
        )
        .bind(endpoint_id)
        .fetch_optional(pool)
        .await
    }

    /// Insert or replace the breaker record for an endpoint.
    pub async fn upsert(pool: &PgPool, state: &CircuitBreakerState) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker_states (
                endpoint_id, state, consecutive_failures,
                window_success_count, window_failure_count,
                window_started_at, open_until, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (endpoint_id) DO UPDATE SET
                state = EXCLUDED.state,
                consecutive_failures = EXCLUDED.consecutive_failures,
                window_success_count = EXCLUDED.window_success_count,
                window_failure_count = EXCLUDED.window_failure_count,
                window_started_at = EXCLUDED.window_started_at,
                open_until = EXCLUDED.open_until,
                updated_at = NOW()
            "#,
        )
        .bind(state.endpoint_id)
        .bind(state.state)
        .bind(state.consecutive_failures)
        .bind(state.window_success_count)
        .bind(state.window_failure_count)
        .bind(state.window_started_at)
        .bind(state.open_until)
        .execute(pool)
        .await?;

        Ok(())
    }
}
