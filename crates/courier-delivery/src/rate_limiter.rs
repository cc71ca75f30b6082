//! Per-endpoint rate limiting.
//!
//! The contract is a fixed-window admission check: `limit` requests per
//! `window`, keyed by endpoint id, with the window anchored at the first
//! allowed request. The bundled implementation keeps one shared bucket per
//! key behind a single lock so every worker in the process observes the
//! same counts; a centralized store can implement the same trait for
//! multi-process deployments. Occasional over-admission by one request
//! under contention is tolerated.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use courier_core::Clock;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Time until the current window ends. Zero when allowed.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }
}

/// Rate limiter backend failure. The processor treats these as advisory
/// and fails open.
#[derive(Debug, Error)]
#[error("rate limiter error: {0}")]
pub struct RateLimitError(pub String);

/// Admission contract consulted before every dispatch.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key`'s window and report whether it is
    /// admitted, with the remaining window on denial.
    async fn allow_with_duration(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// In-process fixed-window limiter shared by all workers of one process.
pub struct FixedWindowLimiter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn allow_with_duration(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError> {
        // A zero limit or window disables limiting for the key.
        if limit == 0 || window.is_zero() {
            return Ok(RateLimitDecision::allowed());
        }

        let now = self.clock.now();
        let window_len =
            chrono::Duration::from_std(window).map_err(|e| RateLimitError(e.to_string()))?;

        let mut windows = self.windows.lock().await;
        let slot = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        // The window is anchored at the first allowed request in it.
        if now - slot.started_at >= window_len {
            slot.started_at = now;
            slot.count = 0;
        }

        if slot.count < limit {
            slot.count += 1;
            return Ok(RateLimitDecision::allowed());
        }

        let remaining = (slot.started_at + window_len) - now;
        let retry_after = remaining.to_std().unwrap_or(Duration::ZERO);
        Ok(RateLimitDecision::denied(retry_after))
    }
}
