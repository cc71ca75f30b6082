//! Stuck-delivery reaper.
//!
//! A worker that dies mid-job leaves its delivery in `processing`. The
//! reaper periodically reclaims deliveries stuck there past a threshold
//! and puts them back on the event queue. The repository resets them to
//! `scheduled` under `FOR UPDATE SKIP LOCKED` so concurrent reapers never
//! collide.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier_db::models::EventDeliveryStatus;
use courier_db::EventDeliveryRepository;

use crate::queue::{EventDeliveryJob, Job, ProcessorKind, QueueName, Queuer};

/// How often the reaper scans, by default.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Age past which a `processing` delivery counts as stuck, by default.
const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(30);

/// Rows reclaimed per scan.
const DEFAULT_BATCH_SIZE: i64 = 100;

/// Periodic task re-enqueueing deliveries abandoned mid-processing.
pub struct StuckDeliveryReaper {
    deliveries: Arc<dyn EventDeliveryRepository>,
    queuer: Arc<dyn Queuer>,
    poll_interval: Duration,
    stuck_threshold: Duration,
    batch_size: i64,
}

impl StuckDeliveryReaper {
    #[must_use]
    pub fn new(deliveries: Arc<dyn EventDeliveryRepository>, queuer: Arc<dyn Queuer>) -> Self {
        Self {
            deliveries,
            queuer,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size;
        self
    }

    /// Run until the token is cancelled.
    pub async fn run(self, token: CancellationToken) {
        tracing::info!(target: "reaper", "Stuck delivery reaper started");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::info!(target: "reaper", "Stuck delivery reaper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.reap_once().await;
                }
            }
        }
    }

    /// One reclaim pass. Errors are logged; the next tick tries again.
    pub async fn reap_once(&self) {
        let older_than = chrono::Duration::from_std(self.stuck_threshold).unwrap_or_default();
        let stuck = match self
            .deliveries
            .find_stuck_by_status(EventDeliveryStatus::Processing, older_than, self.batch_size)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(
                    target: "reaper",
                    error = %e,
                    "Failed to reclaim stuck deliveries"
                );
                return;
            }
        };

        if stuck.is_empty() {
            return;
        }

        tracing::info!(
            target: "reaper",
            count = stuck.len(),
            "Re-enqueueing stuck deliveries"
        );

        for delivery in stuck {
            let payload = EventDeliveryJob {
                event_delivery_id: delivery.id,
                project_id: delivery.project_id,
            };
            let job = match Job::immediate(&payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(
                        target: "reaper",
                        delivery_id = %delivery.id,
                        error = %e,
                        "Failed to encode reaped delivery job"
                    );
                    continue;
                }
            };

            if let Err(e) = self
                .queuer
                .write(ProcessorKind::EventDelivery, QueueName::Event, &job)
                .await
            {
                tracing::error!(
                    target: "reaper",
                    delivery_id = %delivery.id,
                    error = %e,
                    "Failed to re-enqueue stuck delivery"
                );
            }
        }
    }
}
