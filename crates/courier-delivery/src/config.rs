//! Per-delivery configuration resolution.
//!
//! Policy can be set at three levels. For the retry strategy a
//! subscription override wins, then the strategy stamped on the delivery's
//! metadata at ingest, then the project config; for the rate limit the
//! subscription override wins, then an endpoint-level limit, then the
//! project default.

use courier_db::models::{
    DeliveryMetadata, Endpoint, Project, RateLimitConfiguration, StrategyConfiguration,
    Subscription,
};

use crate::strategy::RetryStrategy;

/// Resolved retry policy for one delivery.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    pub retry_count: u64,
}

/// The configuration sources for one delivery, in override order.
pub struct DeliveryConfig<'a> {
    pub subscription: Option<&'a Subscription>,
    pub project: &'a Project,
    pub endpoint: &'a Endpoint,
}

impl DeliveryConfig<'_> {
    /// Resolve the retry strategy for a delivery: subscription override,
    /// then the delivery's own metadata, then the project config. The
    /// metadata is what ingest stamped from the config that was current at
    /// creation time; the project branch only fires for deliveries that
    /// were never stamped.
    #[must_use]
    pub fn retry_config(&self, metadata: &DeliveryMetadata) -> RetryConfig {
        if let Some(config) = self.subscription.and_then(|s| s.retry_config.as_deref()) {
            return RetryConfig {
                strategy: RetryStrategy::from_config(config),
                retry_count: config.retry_count,
            };
        }

        if metadata.interval_seconds > 0 {
            return RetryConfig {
                strategy: RetryStrategy::from_metadata(metadata),
                retry_count: metadata.retry_limit,
            };
        }

        let config: &StrategyConfiguration = &self.project.config.strategy;
        RetryConfig {
            strategy: RetryStrategy::from_config(config),
            retry_count: config.retry_count,
        }
    }

    /// Resolve the rate limit: subscription override, then endpoint, then
    /// project.
    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfiguration {
        if let Some(config) = self.subscription.and_then(|s| s.rate_limit_config.as_deref()) {
            return *config;
        }
        if self.endpoint.rate_limit > 0 {
            return RateLimitConfiguration {
                count: self.endpoint.rate_limit.unsigned_abs(),
                duration: self.endpoint.rate_limit_duration.unsigned_abs().into(),
            };
        }
        self.project.config.rate_limit
    }
}
