//! Retry delay computation.
//!
//! The strategy is a sum type so the delay math lives in one place. A
//! subscriber's `Retry-After` on 429/503 can stretch (never shrink) the
//! computed delay.

use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_db::models::{DeliveryMetadata, StrategyConfiguration, StrategyKind};

/// Fallback exponential cap when a delivery's metadata carries none.
const DEFAULT_MAX_RETRY_SECONDS: u64 = 7200;

/// The function mapping `num_trials` to the next delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// A constant interval between attempts.
    Linear { interval: Duration },
    /// `base * 2^num_trials`, capped.
    Exponential { base: Duration, cap: Duration },
}

impl RetryStrategy {
    /// Build a strategy from persisted configuration.
    #[must_use]
    pub fn from_config(config: &StrategyConfiguration) -> Self {
        match config.kind {
            StrategyKind::Linear => Self::Linear {
                interval: Duration::from_secs(config.duration),
            },
            StrategyKind::Exponential => Self::Exponential {
                base: Duration::from_secs(config.duration),
                cap: Duration::from_secs(config.max_retry_seconds),
            },
        }
    }

    /// Build a strategy from the metadata stamped on a delivery at ingest.
    #[must_use]
    pub fn from_metadata(metadata: &DeliveryMetadata) -> Self {
        let interval = Duration::from_secs(metadata.interval_seconds);
        match metadata.strategy {
            StrategyKind::Linear => Self::Linear { interval },
            StrategyKind::Exponential => {
                let cap = match metadata.max_retry_seconds {
                    0 => DEFAULT_MAX_RETRY_SECONDS,
                    secs => secs,
                };
                Self::Exponential {
                    base: interval,
                    cap: Duration::from_secs(cap),
                }
            }
        }
    }

    /// Delay before the next attempt, given the number of attempts already
    /// executed.
    #[must_use]
    pub fn delay(&self, num_trials: u64) -> Duration {
        match self {
            Self::Linear { interval } => *interval,
            Self::Exponential { base, cap } => {
                let exp = u32::try_from(num_trials.min(63)).unwrap_or(63);
                let delay = base
                    .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
                    .unwrap_or(*cap);
                delay.min(*cap)
            }
        }
    }
}

/// Statuses on which a subscriber's `Retry-After` is honored.
fn honors_retry_after(status: u16) -> bool {
    status == 429 || status == 503
}

/// Apply a `Retry-After` header to a strategy-computed delay.
///
/// The header wins only when it asks for a longer wait than the strategy,
/// and only on 429/503. Both delta-seconds and HTTP-date forms are
/// accepted; an unparsable value is ignored.
#[must_use]
pub fn apply_retry_after(
    strategy_delay: Duration,
    status: u16,
    retry_after: Option<&str>,
    now: DateTime<Utc>,
) -> Duration {
    if !honors_retry_after(status) {
        return strategy_delay;
    }
    let Some(value) = retry_after else {
        return strategy_delay;
    };
    let Some(requested) = parse_retry_after(value, now) else {
        return strategy_delay;
    };

    strategy_delay.max(requested)
}

fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    u64::try_from(delta.num_seconds()).ok().map(Duration::from_secs)
}
