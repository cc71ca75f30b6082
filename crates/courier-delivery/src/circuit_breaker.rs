//! Circuit breaking for delivery endpoints.
//!
//! Per-endpoint fail-fast state machine:
//!
//! - **closed → open** when the windowed failure rate crosses the threshold
//!   with enough samples, or on a consecutive-failure streak
//! - **open → half-open** once the breaker timeout elapses
//! - **half-open → closed** after enough consecutive successful probes
//! - **half-open → open** on any failure
//!
//! State lives in a [`BreakerStore`] shared between workers so breakers
//! survive restarts. The manager is consulted before dispatch and updated
//! after the outcome is classified; updates are best-effort from the
//! processor's point of view.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use courier_core::{Clock, EndpointId};
use courier_db::models::{CircuitBreakerState, CircuitState};
use courier_db::{Database, DbError};

/// Tuning knobs for the breaker state machine.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Windowed failure percentage that trips the breaker.
    pub failure_rate_threshold: u32,
    /// Samples required in the window before the rate is meaningful.
    pub minimum_request_count: u32,
    /// Consecutive failures that trip the breaker regardless of rate.
    pub consecutive_failure_threshold: u32,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Rolling observation window, in seconds.
    pub observation_window_secs: u64,
    /// Time an open breaker waits before probing, in seconds.
    pub breaker_timeout_secs: u64,
    /// In half-open, one request in `probe_ratio` is allowed through.
    pub probe_ratio: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50,
            minimum_request_count: 10,
            consecutive_failure_threshold: 3,
            success_threshold: 2,
            observation_window_secs: 300,
            breaker_timeout_secs: 30,
            probe_ratio: 5,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_rate_threshold(mut self, percent: u32) -> Self {
        self.failure_rate_threshold = percent;
        self
    }

    #[must_use]
    pub fn with_minimum_request_count(mut self, count: u32) -> Self {
        self.minimum_request_count = count;
        self
    }

    #[must_use]
    pub fn with_consecutive_failure_threshold(mut self, count: u32) -> Self {
        self.consecutive_failure_threshold = count;
        self
    }

    #[must_use]
    pub fn with_success_threshold(mut self, count: u32) -> Self {
        self.success_threshold = count;
        self
    }

    #[must_use]
    pub fn with_breaker_timeout(mut self, secs: u64) -> Self {
        self.breaker_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_observation_window(mut self, secs: u64) -> Self {
        self.observation_window_secs = secs;
        self
    }

    #[must_use]
    pub fn with_probe_ratio(mut self, ratio: u32) -> Self {
        self.probe_ratio = ratio.max(1);
        self
    }
}

/// What the processor should do with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Circuit closed, dispatch normally.
    Allow,
    /// Circuit recovering, this dispatch is a probe.
    Probe,
    /// Circuit open, reschedule after `retry_after`.
    Defer { retry_after: Duration },
}

/// Shared persistence for breaker state.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self, endpoint_id: EndpointId) -> Result<Option<CircuitBreakerState>, DbError>;
    async fn save(&self, state: &CircuitBreakerState) -> Result<(), DbError>;
}

/// Store backed by the `circuit_breaker_states` table.
#[derive(Clone)]
pub struct PgBreakerStore {
    db: Database,
}

impl PgBreakerStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BreakerStore for PgBreakerStore {
    async fn load(&self, endpoint_id: EndpointId) -> Result<Option<CircuitBreakerState>, DbError> {
        Ok(CircuitBreakerState::find_by_endpoint(self.db.reader(), endpoint_id).await?)
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<(), DbError> {
        Ok(CircuitBreakerState::upsert(self.db.writer(), state).await?)
    }
}

/// Process-local store. For tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryBreakerStore {
    states: RwLock<HashMap<EndpointId, CircuitBreakerState>>,
}

impl InMemoryBreakerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn load(&self, endpoint_id: EndpointId) -> Result<Option<CircuitBreakerState>, DbError> {
        Ok(self.states.read().await.get(&endpoint_id).cloned())
    }

    async fn save(&self, state: &CircuitBreakerState) -> Result<(), DbError> {
        self.states
            .write()
            .await
            .insert(state.endpoint_id, state.clone());
        Ok(())
    }
}

/// Owns the transition rules over the shared state.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    store: Arc<dyn BreakerStore>,
    clock: Arc<dyn Clock>,
    // Serializes load-mutate-save cycles within this process.
    update_lock: Mutex<()>,
}

impl CircuitBreakerManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn BreakerStore>,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            update_lock: Mutex::new(()),
        }
    }

    /// Decide whether a delivery to `endpoint_id` may proceed.
    pub async fn check(&self, endpoint_id: EndpointId) -> Result<BreakerDecision, DbError> {
        let _guard = self.update_lock.lock().await;
        let now = self.clock.now();
        let mut state = self
            .store
            .load(endpoint_id)
            .await?
            .unwrap_or_else(|| CircuitBreakerState::closed(endpoint_id, now));

        match state.state {
            CircuitState::Closed => Ok(BreakerDecision::Allow),
            CircuitState::Open => {
                let open_until = state.open_until.unwrap_or(now);
                if now >= open_until {
                    state.state = CircuitState::HalfOpen;
                    state.open_until = None;
                    // Probe successes are counted from a clean slate.
                    state.window_success_count = 0;
                    state.window_failure_count = 0;
                    state.window_started_at = now;
                    self.store.save(&state).await?;
                    tracing::info!(
                        target: "circuit_breaker",
                        endpoint_id = %endpoint_id,
                        "Circuit breaker half-open, probing endpoint"
                    );
                    return Ok(BreakerDecision::Probe);
                }

                let retry_after = (open_until - now).to_std().unwrap_or(Duration::ZERO);
                Ok(BreakerDecision::Defer { retry_after })
            }
            CircuitState::HalfOpen => {
                if rand::thread_rng().gen_range(0..self.config.probe_ratio) == 0 {
                    Ok(BreakerDecision::Probe)
                } else {
                    Ok(BreakerDecision::Defer {
                        retry_after: Duration::from_secs(self.config.breaker_timeout_secs),
                    })
                }
            }
        }
    }

    /// Report a successful dispatch.
    pub async fn record_success(&self, endpoint_id: EndpointId) -> Result<(), DbError> {
        let _guard = self.update_lock.lock().await;
        let now = self.clock.now();
        let mut state = self
            .store
            .load(endpoint_id)
            .await?
            .unwrap_or_else(|| CircuitBreakerState::closed(endpoint_id, now));

        self.roll_window(&mut state);
        state.window_success_count += 1;
        state.consecutive_failures = 0;

        if state.state == CircuitState::HalfOpen
            && state.window_success_count >= i32::try_from(self.config.success_threshold).unwrap_or(i32::MAX)
        {
            state = CircuitBreakerState::closed(endpoint_id, now);
            tracing::info!(
                target: "circuit_breaker",
                endpoint_id = %endpoint_id,
                "Circuit breaker closed after successful probes"
            );
        }

        self.store.save(&state).await
    }

    /// Report a failed dispatch.
    pub async fn record_failure(&self, endpoint_id: EndpointId) -> Result<(), DbError> {
        let _guard = self.update_lock.lock().await;
        let now = self.clock.now();
        let mut state = self
            .store
            .load(endpoint_id)
            .await?
            .unwrap_or_else(|| CircuitBreakerState::closed(endpoint_id, now));

        self.roll_window(&mut state);
        state.window_failure_count += 1;
        state.consecutive_failures += 1;

        match state.state {
            CircuitState::Closed => {
                if self.should_trip(&state) {
                    self.open(&mut state);
                    tracing::warn!(
                        target: "circuit_breaker",
                        endpoint_id = %endpoint_id,
                        consecutive_failures = state.consecutive_failures,
                        window_failures = state.window_failure_count,
                        window_samples = state.sample_count(),
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(&mut state);
                tracing::warn!(
                    target: "circuit_breaker",
                    endpoint_id = %endpoint_id,
                    "Circuit breaker reopened after failed probe"
                );
            }
            CircuitState::Open => {}
        }

        self.store.save(&state).await
    }

    fn roll_window(&self, state: &mut CircuitBreakerState) {
        let now = self.clock.now();
        let window = chrono::Duration::seconds(
            i64::try_from(self.config.observation_window_secs).unwrap_or(i64::MAX),
        );
        if now - state.window_started_at >= window {
            state.window_started_at = now;
            state.window_success_count = 0;
            state.window_failure_count = 0;
        }
    }

    fn should_trip(&self, state: &CircuitBreakerState) -> bool {
        if state.consecutive_failures
            >= i32::try_from(self.config.consecutive_failure_threshold).unwrap_or(i32::MAX)
        {
            return true;
        }

        let samples = state.sample_count();
        if samples < i32::try_from(self.config.minimum_request_count).unwrap_or(i32::MAX) {
            return false;
        }

        let failure_rate = state.window_failure_count * 100 / samples.max(1);
        failure_rate >= i32::try_from(self.config.failure_rate_threshold).unwrap_or(i32::MAX)
    }

    fn open(&self, state: &mut CircuitBreakerState) {
        let now = self.clock.now();
        state.state = CircuitState::Open;
        state.open_until = Some(
            now + chrono::Duration::seconds(
                i64::try_from(self.config.breaker_timeout_secs).unwrap_or(i64::MAX),
            ),
        );
    }
}
