//! Error types for the delivery pipeline.

use thiserror::Error;

use crate::queue::QueueError;
use courier_db::DbError;

/// Errors the delivery processor returns to the queue.
///
/// Anything surfaced here causes the broker to redeliver the job; paths
/// that must acknowledge the job (terminal deliveries, policy discards,
/// reschedules) return `Ok` instead.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The in-flight dispatch was aborted by cancellation. The attempt is
    /// still recorded; the job is retried via queue redelivery.
    #[error("delivery cancelled mid-dispatch")]
    Cancelled,
}
