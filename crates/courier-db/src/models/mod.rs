//! Delivery domain entities.
//!
//! Each entity owns its SQL as associated functions in the style of the
//! rest of the persistence layer; the repository structs in [`crate::repo`]
//! delegate to them.

pub mod circuit_breaker_state;
pub mod delivery_attempt;
pub mod endpoint;
pub mod event_delivery;
pub mod project;
pub mod subscription;

pub use circuit_breaker_state::{CircuitBreakerState, CircuitState};
pub use delivery_attempt::{AttemptRequest, AttemptResponse, DeliveryAttempt};
pub use endpoint::{Endpoint, EndpointStatus, Secret};
pub use event_delivery::{DeliveryMetadata, DeliveryMode, EventDelivery, EventDeliveryStatus};
pub use project::{
    Project, ProjectConfig, RateLimitConfiguration, SignatureConfiguration, SignatureEncoding,
    SignatureHash, SignatureVersion, SslConfiguration, StrategyConfiguration, StrategyKind,
};
pub use subscription::{AlertConfiguration, FilterConfiguration, Subscription};
