//! Core types shared across the courier workspace.
//!
//! Provides strongly-typed identifiers for the delivery domain and the
//! injectable time/id abstractions the delivery processor depends on, so
//! behavior stays deterministic under test.

pub mod clock;
pub mod ids;

pub use clock::{Clock, IdSource, RandomIds, SequentialIds, SimulatedClock, SystemClock};
pub use ids::{
    DeliveryAttemptId, EndpointId, EventDeliveryId, EventId, ParseIdError, ProjectId,
    SubscriptionId,
};
