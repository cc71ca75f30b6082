//! Delivery observability hook.
//!
//! The processor emits a capture for every handled job, including the paths
//! that never dispatch (terminal short-circuits, policy discards), so the
//! metrics backend sees every decision.

use courier_db::models::EventDelivery;

/// Sink for per-delivery capture events.
pub trait DeliveryObserver: Send + Sync {
    fn capture(&self, delivery: &EventDelivery);
}

/// Observer that emits structured tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn capture(&self, delivery: &EventDelivery) {
        tracing::info!(
            target: "delivery",
            delivery_id = %delivery.id,
            project_id = %delivery.project_id,
            endpoint_id = %delivery.endpoint_id,
            status = ?delivery.status,
            num_trials = delivery.metadata.num_trials,
            latency_seconds = delivery.latency_seconds,
            "Delivery captured"
        );
    }
}
