//! The event-delivery processor.
//!
//! One idempotent handler for one delivery job. The procedure is fixed:
//! load the delivery context, short-circuit terminal deliveries, evaluate
//! the gates in order (endpoint status, rate limit, circuit breaker, IP
//! rules; first rejection wins), build and dispatch the signed request,
//! record the attempt, classify, and apply the retry policy.
//!
//! Failure semantics: persistence and queue errors bubble out so the
//! broker redelivers the job; classification never errors; circuit-breaker
//! and rate-limiter updates are best-effort and only log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::types::Json;
use tokio_util::sync::CancellationToken;
use url::Url;

use courier_core::{Clock, DeliveryAttemptId, IdSource, RandomIds, SystemClock};
use courier_db::models::{
    delivery_attempt::body_snippet, AttemptRequest, AttemptResponse, DeliveryAttempt, Endpoint,
    EndpointStatus, EventDelivery, EventDeliveryStatus,
};
use courier_db::{
    DeliveryAttemptsRepository, EndpointRepository, EventDeliveryRepository, ProjectRepository,
    SubscriptionRepository,
};

use crate::circuit_breaker::{BreakerDecision, CircuitBreakerManager};
use crate::config::DeliveryConfig;
use crate::dispatcher::{DispatchError, DispatchRequest, DispatchResponse, Dispatcher};
use crate::error::DeliveryError;
use crate::licenser::Licenser;
use crate::queue::{
    EndpointNotification, EventDeliveryJob, Job, NotificationKind, ProcessorKind, QueueName, Queuer,
};
use crate::rate_limiter::RateLimiter;
use crate::signer::signature_headers;
use crate::strategy::apply_retry_after;
use crate::telemetry::{DeliveryObserver, TracingObserver};
use crate::USER_AGENT;

/// Header carrying the delivery id on every dispatch.
pub const DELIVERY_ID_HEADER: &str = "X-Courier-Delivery-Id";

/// Header carrying the idempotency key, when the delivery has one.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// The worker-side handler for delivery jobs.
pub struct DeliveryProcessor {
    endpoints: Arc<dyn EndpointRepository>,
    projects: Arc<dyn ProjectRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    deliveries: Arc<dyn EventDeliveryRepository>,
    attempts: Arc<dyn DeliveryAttemptsRepository>,
    queuer: Arc<dyn Queuer>,
    rate_limiter: Arc<dyn RateLimiter>,
    breaker: Arc<CircuitBreakerManager>,
    dispatcher: Arc<Dispatcher>,
    licenser: Arc<dyn Licenser>,
    observer: Arc<dyn DeliveryObserver>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl DeliveryProcessor {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        endpoints: Arc<dyn EndpointRepository>,
        projects: Arc<dyn ProjectRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        deliveries: Arc<dyn EventDeliveryRepository>,
        attempts: Arc<dyn DeliveryAttemptsRepository>,
        queuer: Arc<dyn Queuer>,
        rate_limiter: Arc<dyn RateLimiter>,
        breaker: Arc<CircuitBreakerManager>,
        dispatcher: Arc<Dispatcher>,
        licenser: Arc<dyn Licenser>,
    ) -> Self {
        Self {
            endpoints,
            projects,
            subscriptions,
            deliveries,
            attempts,
            queuer,
            rate_limiter,
            breaker,
            dispatcher,
            licenser,
            observer: Arc::new(TracingObserver),
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
        }
    }

    /// Replace the capture sink.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the id source.
    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Handle one delivery job.
    ///
    /// Exactly one execution produces exactly one attempt unless a
    /// pre-dispatch gate rejects the job. Returning `Ok` acknowledges the
    /// job; returning an error hands it back to the broker for redelivery.
    pub async fn process(
        &self,
        job: &EventDeliveryJob,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let Some(mut delivery) = self
            .deliveries
            .find_by_id_slim(job.project_id, job.event_delivery_id)
            .await?
        else {
            tracing::warn!(
                target: "delivery",
                delivery_id = %job.event_delivery_id,
                project_id = %job.project_id,
                "Delivery not found, dropping job"
            );
            return Ok(());
        };

        let Some(endpoint) = self
            .endpoints
            .find_by_id(delivery.project_id, delivery.endpoint_id)
            .await?
        else {
            tracing::warn!(
                target: "delivery",
                delivery_id = %delivery.id,
                endpoint_id = %delivery.endpoint_id,
                "Endpoint no longer exists, discarding delivery"
            );
            return self.discard(&mut delivery).await;
        };

        let Some(project) = self.projects.fetch_by_id(delivery.project_id).await? else {
            tracing::warn!(
                target: "delivery",
                delivery_id = %delivery.id,
                project_id = %delivery.project_id,
                "Project no longer exists, dropping job"
            );
            return Ok(());
        };

        let subscription = match delivery.subscription_id {
            Some(id) => self.subscriptions.find_by_id(delivery.project_id, id).await?,
            None => None,
        };

        // Terminal deliveries are a no-op besides the capture.
        if delivery.status.is_terminal() {
            tracing::info!(
                target: "delivery",
                delivery_id = %delivery.id,
                status = ?delivery.status,
                "Delivery already in terminal state"
            );
            self.observer.capture(&delivery);
            return Ok(());
        }

        self.transition(&mut delivery, EventDeliveryStatus::Processing)
            .await?;

        let config = DeliveryConfig {
            subscription: subscription.as_ref(),
            project: &project,
            endpoint: &endpoint,
        };

        // Gate: endpoint status.
        if !endpoint.status.is_deliverable() {
            tracing::info!(
                target: "delivery",
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                endpoint_status = ?endpoint.status,
                "Endpoint cannot receive deliveries, discarding"
            );
            return self.discard(&mut delivery).await;
        }

        // Gate: rate limit. Backend failures fail open.
        let rate = config.rate_limit_config();
        match self
            .rate_limiter
            .allow_with_duration(
                &endpoint.id.to_string(),
                rate.count,
                Duration::from_secs(rate.duration),
            )
            .await
        {
            Ok(decision) if !decision.allowed => {
                tracing::info!(
                    target: "delivery",
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    retry_after_ms = decision.retry_after.as_millis() as u64,
                    "Endpoint rate limited, rescheduling delivery"
                );
                return self.reschedule(&mut delivery, job, decision.retry_after).await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    target: "delivery",
                    delivery_id = %delivery.id,
                    error = %e,
                    "Rate limiter unavailable, allowing delivery"
                );
            }
        }

        // Gate: circuit breaker, when licensed. Store failures fail open.
        if self.licenser.circuit_breaking() {
            match self.breaker.check(endpoint.id).await {
                Ok(BreakerDecision::Defer { retry_after }) => {
                    tracing::info!(
                        target: "delivery",
                        delivery_id = %delivery.id,
                        endpoint_id = %endpoint.id,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Circuit breaker deferred delivery"
                    );
                    return self.reschedule(&mut delivery, job, retry_after).await;
                }
                Ok(BreakerDecision::Allow | BreakerDecision::Probe) => {}
                Err(e) => {
                    tracing::error!(
                        target: "delivery",
                        delivery_id = %delivery.id,
                        error = %e,
                        "Circuit breaker unavailable, allowing delivery"
                    );
                }
            }
        }

        let url = match merge_query_params(&endpoint.url, &delivery.url_query_params) {
            Ok(url) => url,
            Err(reason) => {
                tracing::warn!(
                    target: "delivery",
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    error = %reason,
                    "Endpoint URL is invalid, discarding delivery"
                );
                return self.discard(&mut delivery).await;
            }
        };

        // Gate: IP rules, when licensed. A blocked destination is a policy
        // rejection, not a retryable failure. Resolution errors fall
        // through to dispatch, which reports them as transport failures.
        if self.licenser.ip_rules() {
            match self.dispatcher.check_destination(url.as_str()).await {
                Err(e) if e.is_blocked() => {
                    tracing::warn!(
                        target: "delivery",
                        delivery_id = %delivery.id,
                        endpoint_id = %endpoint.id,
                        error = %e,
                        "Destination rejected by IP policy, discarding delivery"
                    );
                    return self.discard(&mut delivery).await;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "delivery",
                        delivery_id = %delivery.id,
                        error = %e,
                        "Destination pre-check failed"
                    );
                }
                Ok(_) => {}
            }
        }

        let body = delivery.metadata.raw.clone().into_bytes();
        let headers = self.build_headers(&delivery, &endpoint, &config, &body);

        let started_at = self.clock.now();
        let timer = Instant::now();
        let outcome = self
            .dispatcher
            .dispatch(
                DispatchRequest {
                    url: url.to_string(),
                    headers: headers.clone(),
                    body: body.clone(),
                },
                project.config.ssl.enforce_secure_endpoints,
                cancel,
            )
            .await;
        let latency = timer.elapsed();
        let ended_at = self.clock.now();

        // The attempt is evidence; it is persisted before any status
        // transition, whatever the outcome.
        let attempt = self.build_attempt(&delivery, url.as_str(), &headers, &body, &outcome, started_at, ended_at);
        self.attempts.create(&attempt).await?;

        if matches!(outcome, Err(DispatchError::Cancelled)) {
            tracing::warn!(
                target: "delivery",
                delivery_id = %delivery.id,
                "Dispatch cancelled, leaving job to queue redelivery"
            );
            return Err(DeliveryError::Cancelled);
        }

        let classification = classify(&outcome);

        if self.licenser.circuit_breaking() {
            let update = if classification.success {
                self.breaker.record_success(endpoint.id).await
            } else {
                self.breaker.record_failure(endpoint.id).await
            };
            if let Err(e) = update {
                tracing::error!(
                    target: "delivery",
                    endpoint_id = %endpoint.id,
                    error = %e,
                    "Failed to update circuit breaker"
                );
            }
        }

        // A delivery whose budget was already exhausted at load time was
        // re-run by an operator.
        let was_manual = delivery.metadata.num_trials >= delivery.effective_retry_limit();

        delivery.metadata.num_trials += 1;
        delivery.latency_seconds = latency.as_secs_f64();

        let mut retry_delay = None;

        if classification.success {
            delivery.status = EventDeliveryStatus::Success;
            delivery.description.clear();
            delivery.metadata.next_send_time = None;

            tracing::info!(
                target: "delivery",
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                num_trials = delivery.metadata.num_trials,
                latency_seconds = delivery.latency_seconds,
                "Delivery succeeded"
            );

            if was_manual
                && endpoint.status == EndpointStatus::Pending
                && self.licenser.advanced_endpoint_mgmt()
            {
                self.endpoints
                    .update_status(delivery.project_id, endpoint.id, EndpointStatus::Active)
                    .await?;
                self.notify(
                    &endpoint,
                    NotificationKind::EndpointEnabled,
                    "Endpoint re-enabled after successful manual delivery",
                )
                .await;
            }
        } else {
            delivery.description.clone_from(&classification.description);

            tracing::warn!(
                target: "delivery",
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                num_trials = delivery.metadata.num_trials,
                description = %classification.description,
                "Delivery failed"
            );

            if delivery.metadata.num_trials < delivery.effective_retry_limit() {
                delivery.status = EventDeliveryStatus::Retry;

                let delay = self.next_delay(&delivery, &config, &classification);
                delivery.metadata.next_send_time =
                    Some(self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default());
                retry_delay = Some(delay);
            } else {
                delivery.status = EventDeliveryStatus::Failure;
                delivery.metadata.next_send_time = None;

                if project.config.disable_endpoint && self.licenser.advanced_endpoint_mgmt() {
                    tracing::warn!(
                        target: "delivery",
                        endpoint_id = %endpoint.id,
                        project_id = %delivery.project_id,
                        "Disabling endpoint after retries were exhausted"
                    );
                    self.endpoints
                        .update_status(delivery.project_id, endpoint.id, EndpointStatus::Inactive)
                        .await?;
                    self.notify(
                        &endpoint,
                        NotificationKind::EndpointDisabled,
                        &classification.description,
                    )
                    .await;
                }
            }
        }

        // One write carries status, trial count, schedule and latency.
        self.deliveries
            .update_metadata(delivery.project_id, &delivery)
            .await?;

        if let Some(delay) = retry_delay {
            self.requeue(job, delay).await?;
        }

        self.observer.capture(&delivery);
        Ok(())
    }

    /// Delay before the next attempt, resolved through the config chain
    /// (subscription override, then the delivery's own metadata, then the
    /// project strategy), stretched by `Retry-After` when the subscriber
    /// asked for a longer wait.
    fn next_delay(
        &self,
        delivery: &EventDelivery,
        config: &DeliveryConfig<'_>,
        classification: &Classification,
    ) -> Duration {
        let strategy = config.retry_config(&delivery.metadata).strategy;
        let delay = strategy.delay(delivery.metadata.num_trials);
        apply_retry_after(
            delay,
            classification.http_status.unwrap_or(0),
            classification.retry_after.as_deref(),
            self.clock.now(),
        )
    }

    fn build_headers(
        &self,
        delivery: &EventDelivery,
        endpoint: &Endpoint,
        config: &DeliveryConfig<'_>,
        body: &[u8],
    ) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
            (DELIVERY_ID_HEADER.to_string(), delivery.id.to_string()),
        ];

        if let Some(key) = delivery.idempotency_key.as_ref().filter(|k| !k.is_empty()) {
            headers.push((IDEMPOTENCY_HEADER.to_string(), key.clone()));
        }

        if let Some(subscription) = config.subscription {
            if let Some(custom) = &subscription.custom_headers {
                for (name, value) in custom.iter() {
                    headers.push((name.clone(), value.clone()));
                }
            }
        }

        if let Some(stored) = &delivery.headers {
            for (name, value) in stored.iter() {
                headers.push((name.clone(), value.clone()));
            }
        }

        let now = self.clock.now();
        let secrets = endpoint.usable_secrets(now);
        // Without advanced signatures only the active (first) version and
        // secret are sent.
        let mut signature_config = config.project.config.signature.clone();
        let secrets = if endpoint.advanced_signatures {
            secrets
        } else {
            signature_config.versions.truncate(1);
            secrets.into_iter().take(1).collect()
        };
        headers.extend(signature_headers(&signature_config, &secrets, body, now));

        headers
    }

    #[allow(clippy::too_many_arguments)]
    fn build_attempt(
        &self,
        delivery: &EventDelivery,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
        outcome: &Result<DispatchResponse, DispatchError>,
        started_at: chrono::DateTime<chrono::Utc>,
        ended_at: chrono::DateTime<chrono::Utc>,
    ) -> DeliveryAttempt {
        let (response, error, http_status, ip_address) = match outcome {
            Ok(r) => (
                Some(Json(AttemptResponse {
                    status: r.status,
                    headers: r.headers.clone(),
                    body: body_snippet(&r.body),
                })),
                None,
                i16::try_from(r.status).ok(),
                r.ip_address.map(|ip| ip.to_string()),
            ),
            Err(e) => (None, Some(e.to_string()), None, None),
        };

        DeliveryAttempt {
            id: DeliveryAttemptId::from_uuid(self.ids.generate()),
            event_delivery_id: delivery.id,
            project_id: delivery.project_id,
            request: Json(AttemptRequest {
                method: "POST".to_string(),
                url: url.to_string(),
                headers: headers.iter().cloned().collect::<HashMap<_, _>>(),
                body: body_snippet(body),
            }),
            response,
            error,
            ip_address,
            http_status,
            started_at,
            ended_at,
        }
    }

    async fn transition(
        &self,
        delivery: &mut EventDelivery,
        status: EventDeliveryStatus,
    ) -> Result<(), DeliveryError> {
        self.deliveries
            .update_status(delivery.project_id, delivery.id, status)
            .await?;
        delivery.status = status;
        Ok(())
    }

    /// Policy rejection: one transition to `discarded`, capture, done.
    async fn discard(&self, delivery: &mut EventDelivery) -> Result<(), DeliveryError> {
        self.transition(delivery, EventDeliveryStatus::Discarded)
            .await?;
        self.observer.capture(delivery);
        Ok(())
    }

    /// Deferral (rate limit, open breaker): back to `scheduled` and onto
    /// the queue with a delay. Does not consume retry budget.
    async fn reschedule(
        &self,
        delivery: &mut EventDelivery,
        job: &EventDeliveryJob,
        delay: Duration,
    ) -> Result<(), DeliveryError> {
        self.transition(delivery, EventDeliveryStatus::Scheduled)
            .await?;
        self.requeue(job, delay).await?;
        self.observer.capture(delivery);
        Ok(())
    }

    async fn requeue(&self, job: &EventDeliveryJob, delay: Duration) -> Result<(), DeliveryError> {
        let job = Job::delayed(job, delay)?;
        self.queuer
            .write(ProcessorKind::EventDelivery, QueueName::Event, &job)
            .await?;
        Ok(())
    }

    /// Enqueue an operator notification. Best-effort: requires a support
    /// email and only logs on queue failure.
    async fn notify(&self, endpoint: &Endpoint, kind: NotificationKind, reason: &str) {
        let Some(email) = endpoint.support_email.as_ref().filter(|e| !e.is_empty()) else {
            return;
        };

        let notification = EndpointNotification {
            kind,
            endpoint_id: endpoint.id,
            project_id: endpoint.project_id,
            support_email: email.clone(),
            reason: reason.to_string(),
        };

        let job = match Job::immediate(&notification) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(
                    target: "delivery",
                    endpoint_id = %endpoint.id,
                    error = %e,
                    "Failed to encode endpoint notification"
                );
                return;
            }
        };

        if let Err(e) = self
            .queuer
            .write(ProcessorKind::Notification, QueueName::Default, &job)
            .await
        {
            tracing::error!(
                target: "delivery",
                endpoint_id = %endpoint.id,
                error = %e,
                "Failed to enqueue endpoint notification"
            );
        }
    }
}

struct Classification {
    success: bool,
    description: String,
    http_status: Option<u16>,
    retry_after: Option<String>,
}

/// Fold a dispatch outcome into success/failure plus evidence. Never errors.
fn classify(outcome: &Result<DispatchResponse, DispatchError>) -> Classification {
    match outcome {
        Ok(response) if response.is_success() => Classification {
            success: true,
            description: String::new(),
            http_status: Some(response.status),
            retry_after: None,
        },
        Ok(response) => Classification {
            success: false,
            description: format!("Endpoint returned status code {}", response.status),
            http_status: Some(response.status),
            retry_after: response.retry_after().map(str::to_string),
        },
        Err(error) => Classification {
            success: false,
            description: error.to_string(),
            http_status: None,
            retry_after: None,
        },
    }
}

/// Merge the delivery's stored query parameters into the endpoint URL.
/// Delivery parameters win on key conflicts; the result is sorted by key.
fn merge_query_params(endpoint_url: &str, extra: &str) -> Result<Url, String> {
    let mut url = Url::parse(endpoint_url).map_err(|e| e.to_string())?;
    if extra.is_empty() {
        return Ok(url);
    }

    let mut merged: BTreeMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    for (key, value) in url::form_urlencoded::parse(extra.as_bytes()) {
        merged.insert(key.into_owned(), value.into_owned());
    }

    url.set_query(None);
    if !merged.is_empty() {
        url.query_pairs_mut().extend_pairs(merged.iter());
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn response(status: u16, headers: HashMap<String, String>) -> DispatchResponse {
        DispatchResponse {
            status,
            headers,
            body: Vec::new(),
            ip_address: None,
        }
    }

    #[test]
    fn test_merge_preserves_endpoint_params() {
        let url = merge_query_params("https://x.test?source=a", "").unwrap();
        assert_eq!(url.query(), Some("source=a"));
    }

    #[test]
    fn test_merge_combines_and_sorts() {
        let url = merge_query_params("https://x.test?source=a", "name=b&category=c").unwrap();
        assert_eq!(url.query(), Some("category=c&name=b&source=a"));
    }

    #[test]
    fn test_merge_delivery_params_win_on_conflict() {
        let url = merge_query_params("https://x.test?source=a", "source=b").unwrap();
        assert_eq!(url.query(), Some("source=b"));
    }

    #[test]
    fn test_merge_rejects_invalid_url() {
        assert!(merge_query_params("not a url", "a=b").is_err());
    }

    #[test]
    fn test_classify_2xx_is_success() {
        let outcome = Ok(response(204, HashMap::new()));
        let c = classify(&outcome);
        assert!(c.success);
        assert!(c.description.is_empty());
        assert_eq!(c.http_status, Some(204));
    }

    #[test]
    fn test_classify_non_2xx_description() {
        let outcome = Ok(response(400, HashMap::new()));
        let c = classify(&outcome);
        assert!(!c.success);
        assert_eq!(c.description, "Endpoint returned status code 400");
    }

    #[test]
    fn test_classify_captures_retry_after() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "120".to_string());
        let outcome = Ok(response(429, headers));
        let c = classify(&outcome);
        assert_eq!(c.retry_after.as_deref(), Some("120"));
    }

    #[test]
    fn test_classify_transport_error() {
        let outcome = Err(DispatchError::Transport("connection refused".to_string()));
        let c = classify(&outcome);
        assert!(!c.success);
        assert!(c.description.contains("connection refused"));
        assert_eq!(c.http_status, None);
    }

    #[test]
    fn test_classify_cancelled_description() {
        let outcome = Err(DispatchError::Cancelled);
        let c = classify(&outcome);
        assert_eq!(c.description, "cancelled");
    }
}
