//! Queue contracts and job payloads.
//!
//! The broker itself lives elsewhere; the processor only needs to write
//! jobs: delivery retries back onto the event queue and operator
//! notifications onto the default queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::{EndpointId, EventDeliveryId, ProjectId};

/// The handler a job is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    EventDelivery,
    Notification,
}

/// Named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Event,
    Default,
}

/// A job write: an opaque payload plus an optional delay before it becomes
/// visible to workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub payload: serde_json::Value,
    #[serde(default, with = "duration_secs")]
    pub delay: Duration,
}

impl Job {
    /// A job visible immediately.
    pub fn immediate<T: Serialize>(payload: &T) -> Result<Self, QueueError> {
        Self::delayed(payload, Duration::ZERO)
    }

    /// A job that becomes visible after `delay`.
    pub fn delayed<T: Serialize>(payload: &T, delay: Duration) -> Result<Self, QueueError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| QueueError(format!("encode job: {e}")))?;
        Ok(Self { payload, delay })
    }
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// A queue write failed.
#[derive(Debug, Error)]
#[error("queue write failed: {0}")]
pub struct QueueError(pub String);

/// Task-enqueue contract the processor writes through.
#[async_trait]
pub trait Queuer: Send + Sync {
    async fn write(
        &self,
        kind: ProcessorKind,
        queue: QueueName,
        job: &Job,
    ) -> Result<(), QueueError>;
}

/// Job payload for one delivery (queue → processor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDeliveryJob {
    pub event_delivery_id: EventDeliveryId,
    pub project_id: ProjectId,
}

/// Operator notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "endpoint.disabled")]
    EndpointDisabled,
    #[serde(rename = "endpoint.enabled")]
    EndpointEnabled,
}

/// Job payload for an endpoint state-change notification
/// (processor → notification queue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointNotification {
    pub kind: NotificationKind,
    pub endpoint_id: EndpointId,
    pub project_id: ProjectId,
    pub support_email: String,
    pub reason: String,
}
