//! Event delivery processing for courier.
//!
//! The [`processor::DeliveryProcessor`] is the worker-side handler for one
//! delivery job: it resolves the delivery's context, evaluates gating
//! policies (endpoint status, rate limit, circuit breaker, IP rules),
//! executes a single signed HTTP dispatch, records the attempt, and decides
//! what happens next (succeed, discard, retry, disable the endpoint, notify
//! an operator).
//!
//! ## Circuit Breaker
//!
//! Per-endpoint fail-fast protection. The breaker opens when the observed
//! failure rate or a consecutive-failure streak crosses its thresholds,
//! defers deliveries while open, and probes a fraction of traffic while
//! half-open. State is persisted through a shared store so it survives
//! worker restarts.
//!
//! ## Rate Limiting
//!
//! Per-endpoint fixed-window admission. A denied delivery is rescheduled
//! for the remainder of the window and does not consume retry budget.
//!
//! ## Retries
//!
//! Linear or exponential backoff resolved from the subscription, endpoint
//! and project configuration, with `Retry-After` honored on 429/503 when it
//! asks for a longer wait.

pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod licenser;
pub mod processor;
pub mod queue;
pub mod rate_limiter;
pub mod signer;
pub mod strategy;
pub mod telemetry;
pub mod worker;

pub use circuit_breaker::{
    BreakerDecision, BreakerStore, CircuitBreakerConfig, CircuitBreakerManager,
    InMemoryBreakerStore, PgBreakerStore,
};
pub use dispatcher::{
    DispatchError, DispatchRequest, DispatchResponse, Dispatcher, DispatcherBuilder,
};
pub use config::{DeliveryConfig, RetryConfig};
pub use error::DeliveryError;
pub use licenser::{Licenser, StaticLicenser};
pub use processor::DeliveryProcessor;
pub use queue::{
    EndpointNotification, EventDeliveryJob, Job, NotificationKind, ProcessorKind, QueueError,
    QueueName, Queuer,
};
pub use rate_limiter::{FixedWindowLimiter, RateLimitDecision, RateLimitError, RateLimiter};
pub use signer::SignedHeaders;
pub use strategy::RetryStrategy;
pub use telemetry::{DeliveryObserver, TracingObserver};
pub use worker::StuckDeliveryReaper;

/// User-Agent sent on every outbound dispatch.
pub const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));
