//! Common test utilities for courier-delivery integration tests.
//!
//! Provides in-memory repository implementations, recording queue/observer
//! doubles and fixture builders for exercising the processor without a
//! database. Outbound HTTP is faked with wiremock in the test files.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use tokio_util::sync::CancellationToken;

use courier_core::{
    EndpointId, EventDeliveryId, EventId, ProjectId, SequentialIds, SimulatedClock, SubscriptionId,
};
use courier_db::models::{
    DeliveryAttempt, DeliveryMetadata, DeliveryMode, Endpoint, EndpointStatus, EventDelivery,
    EventDeliveryStatus, FilterConfiguration, Project, ProjectConfig, Secret, StrategyKind,
    Subscription,
};
use courier_db::{
    DbError, DeliveryAttemptsRepository, EndpointRepository, EventDeliveryRepository,
    ProjectRepository, SubscriptionRepository,
};
use courier_delivery::{
    CircuitBreakerConfig, CircuitBreakerManager, DeliveryError, DeliveryObserver,
    DeliveryProcessor, Dispatcher, EventDeliveryJob, FixedWindowLimiter, InMemoryBreakerStore,
    Job, ProcessorKind, QueueError, QueueName, Queuer, RateLimitDecision, RateLimitError,
    RateLimiter, StaticLicenser,
};

pub const SECRET_1: &str = "whsec_test_secret_key_12345";
pub const SUPPORT_EMAIL: &str = "oncall@example.test";

// ---------------------------------------------------------------------------
// In-memory repositories
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryEndpoints {
    rows: Mutex<HashMap<EndpointId, Endpoint>>,
    pub status_updates: Mutex<Vec<(EndpointId, EndpointStatus)>>,
}

impl InMemoryEndpoints {
    pub fn insert(&self, endpoint: Endpoint) {
        self.rows.lock().unwrap().insert(endpoint.id, endpoint);
    }

    pub fn status_of(&self, id: EndpointId) -> Option<EndpointStatus> {
        self.rows.lock().unwrap().get(&id).map(|e| e.status)
    }

    pub fn recorded_status_updates(&self) -> Vec<(EndpointId, EndpointStatus)> {
        self.status_updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl EndpointRepository for InMemoryEndpoints {
    async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: EndpointId,
    ) -> Result<Option<Endpoint>, DbError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&id)
            .filter(|e| e.project_id == project_id)
            .cloned())
    }

    async fn update_status(
        &self,
        _project_id: ProjectId,
        id: EndpointId,
        status: EndpointStatus,
    ) -> Result<(), DbError> {
        self.status_updates.lock().unwrap().push((id, status));
        if let Some(endpoint) = self.rows.lock().unwrap().get_mut(&id) {
            endpoint.status = status;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryProjects {
    rows: Mutex<HashMap<ProjectId, Project>>,
}

impl InMemoryProjects {
    pub fn insert(&self, project: Project) {
        self.rows.lock().unwrap().insert(project.id, project);
    }
}

#[async_trait]
impl ProjectRepository for InMemoryProjects {
    async fn fetch_by_id(&self, id: ProjectId) -> Result<Option<Project>, DbError> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemorySubscriptions {
    rows: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl InMemorySubscriptions {
    pub fn insert(&self, subscription: Subscription) {
        self.rows
            .lock()
            .unwrap()
            .insert(subscription.id, subscription);
    }
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptions {
    async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, DbError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&id)
            .filter(|s| s.project_id == project_id)
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryDeliveries {
    rows: Mutex<HashMap<EventDeliveryId, EventDelivery>>,
    pub status_updates: Mutex<Vec<(EventDeliveryId, EventDeliveryStatus)>>,
    pub metadata_writes: Mutex<Vec<EventDelivery>>,
}

impl InMemoryDeliveries {
    pub fn insert(&self, delivery: EventDelivery) {
        self.rows.lock().unwrap().insert(delivery.id, delivery);
    }

    pub fn get(&self, id: EventDeliveryId) -> Option<EventDelivery> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn recorded_status_updates(&self) -> Vec<(EventDeliveryId, EventDeliveryStatus)> {
        self.status_updates.lock().unwrap().clone()
    }

    pub fn recorded_metadata_writes(&self) -> Vec<EventDelivery> {
        self.metadata_writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventDeliveryRepository for InMemoryDeliveries {
    async fn find_by_id_slim(
        &self,
        project_id: ProjectId,
        id: EventDeliveryId,
    ) -> Result<Option<EventDelivery>, DbError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&id)
            .filter(|d| d.project_id == project_id)
            .cloned())
    }

    async fn update_status(
        &self,
        _project_id: ProjectId,
        id: EventDeliveryId,
        status: EventDeliveryStatus,
    ) -> Result<(), DbError> {
        self.status_updates.lock().unwrap().push((id, status));
        if let Some(delivery) = self.rows.lock().unwrap().get_mut(&id) {
            delivery.status = status;
            delivery.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_metadata(
        &self,
        _project_id: ProjectId,
        delivery: &EventDelivery,
    ) -> Result<(), DbError> {
        self.metadata_writes.lock().unwrap().push(delivery.clone());
        let mut rows = self.rows.lock().unwrap();
        if let Some(stored) = rows.get_mut(&delivery.id) {
            stored.status = delivery.status;
            stored.metadata = delivery.metadata.clone();
            stored.description.clone_from(&delivery.description);
            stored.latency_seconds = delivery.latency_seconds;
            stored.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_stuck_by_status(
        &self,
        status: EventDeliveryStatus,
        older_than: chrono::Duration,
        limit: i64,
    ) -> Result<Vec<EventDelivery>, DbError> {
        let cutoff = Utc::now() - older_than;
        let mut rows = self.rows.lock().unwrap();
        let mut reclaimed = Vec::new();
        for delivery in rows.values_mut() {
            if reclaimed.len() as i64 >= limit {
                break;
            }
            if delivery.status == status && delivery.updated_at < cutoff {
                delivery.status = EventDeliveryStatus::Scheduled;
                delivery.updated_at = Utc::now();
                reclaimed.push(delivery.clone());
            }
        }
        Ok(reclaimed)
    }
}

#[derive(Default)]
pub struct RecordingAttempts {
    pub rows: Mutex<Vec<DeliveryAttempt>>,
}

impl RecordingAttempts {
    pub fn recorded(&self) -> Vec<DeliveryAttempt> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryAttemptsRepository for RecordingAttempts {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<(), DbError> {
        self.rows.lock().unwrap().push(attempt.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue, rate limiter and observer doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingQueuer {
    pub writes: Mutex<Vec<(ProcessorKind, QueueName, Job)>>,
}

impl RecordingQueuer {
    pub fn event_jobs(&self) -> Vec<Job> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _, _)| *kind == ProcessorKind::EventDelivery)
            .map(|(_, _, job)| job.clone())
            .collect()
    }

    pub fn notification_jobs(&self) -> Vec<Job> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _, _)| *kind == ProcessorKind::Notification)
            .map(|(_, _, job)| job.clone())
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl Queuer for RecordingQueuer {
    async fn write(
        &self,
        kind: ProcessorKind,
        queue: QueueName,
        job: &Job,
    ) -> Result<(), QueueError> {
        self.writes.lock().unwrap().push((kind, queue, job.clone()));
        Ok(())
    }
}

/// A rate limiter that denies everything with a fixed retry-after.
pub struct DenyingRateLimiter {
    pub retry_after: Duration,
}

#[async_trait]
impl RateLimiter for DenyingRateLimiter {
    async fn allow_with_duration(
        &self,
        _key: &str,
        _limit: u32,
        _window: Duration,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Ok(RateLimitDecision {
            allowed: false,
            retry_after: self.retry_after,
        })
    }
}

#[derive(Default)]
pub struct CountingObserver {
    captures: AtomicUsize,
}

impl CountingObserver {
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl DeliveryObserver for CountingObserver {
    fn capture(&self, _delivery: &EventDelivery) {
        self.captures.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn project(config: ProjectConfig) -> Project {
    Project {
        id: ProjectId::new(),
        name: "test-project".to_string(),
        config: Json(config),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn endpoint(project: &Project, url: &str) -> Endpoint {
    Endpoint {
        id: EndpointId::new(),
        project_id: project.id,
        name: "test-endpoint".to_string(),
        url: url.to_string(),
        status: EndpointStatus::Active,
        secrets: Json(vec![Secret {
            value: SECRET_1.to_string(),
            expires_at: None,
            created_at: Utc::now(),
        }]),
        rate_limit: 10,
        rate_limit_duration: 60,
        advanced_signatures: true,
        support_email: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn delivery(project: &Project, endpoint: &Endpoint) -> EventDelivery {
    EventDelivery {
        id: EventDeliveryId::new(),
        project_id: project.id,
        event_id: EventId::new(),
        endpoint_id: endpoint.id,
        subscription_id: None,
        delivery_mode: DeliveryMode::AtLeastOnce,
        status: EventDeliveryStatus::Scheduled,
        metadata: Json(DeliveryMetadata {
            data: serde_json::json!({"event": "invoice.completed"}),
            raw: r#"{"event": "invoice.completed"}"#.to_string(),
            num_trials: 0,
            retry_limit: 3,
            interval_seconds: 20,
            strategy: StrategyKind::Linear,
            max_retry_seconds: 7200,
            next_send_time: None,
        }),
        headers: None,
        description: String::new(),
        url_query_params: String::new(),
        idempotency_key: None,
        latency_seconds: 0.0,
        acknowledged_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn subscription(project: &Project, endpoint: &Endpoint) -> Subscription {
    Subscription {
        id: SubscriptionId::new(),
        project_id: project.id,
        endpoint_id: endpoint.id,
        name: "test-subscription".to_string(),
        filter_config: Json(FilterConfiguration::default()),
        retry_config: None,
        rate_limit_config: None,
        alert_config: None,
        custom_headers: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub processor: DeliveryProcessor,
    pub endpoints: Arc<InMemoryEndpoints>,
    pub projects: Arc<InMemoryProjects>,
    pub subscriptions: Arc<InMemorySubscriptions>,
    pub deliveries: Arc<InMemoryDeliveries>,
    pub attempts: Arc<RecordingAttempts>,
    pub queuer: Arc<RecordingQueuer>,
    pub observer: Arc<CountingObserver>,
    pub clock: Arc<SimulatedClock>,
    pub breaker_store: Arc<InMemoryBreakerStore>,
}

/// Optional harness knobs. The default gets an allow-everything rate
/// limiter, an empty breaker store and no IP block list.
#[derive(Default)]
pub struct HarnessOptions {
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub breaker_store: Option<Arc<InMemoryBreakerStore>>,
    pub breaker_config: Option<CircuitBreakerConfig>,
    pub block_list: Vec<String>,
}

pub fn harness(licenser: StaticLicenser) -> Harness {
    harness_with(licenser, HarnessOptions::default())
}

pub fn harness_with(licenser: StaticLicenser, options: HarnessOptions) -> Harness {
    let clock = Arc::new(SimulatedClock::new(Utc::now()));
    let endpoints = Arc::new(InMemoryEndpoints::default());
    let projects = Arc::new(InMemoryProjects::default());
    let subscriptions = Arc::new(InMemorySubscriptions::default());
    let deliveries = Arc::new(InMemoryDeliveries::default());
    let attempts = Arc::new(RecordingAttempts::default());
    let queuer = Arc::new(RecordingQueuer::default());
    let observer = Arc::new(CountingObserver::default());

    let licenser = Arc::new(licenser);
    let breaker_store = options
        .breaker_store
        .unwrap_or_else(|| Arc::new(InMemoryBreakerStore::new()));
    let breaker = Arc::new(CircuitBreakerManager::new(
        breaker_store.clone(),
        clock.clone(),
        options.breaker_config.unwrap_or_default(),
    ));
    let rate_limiter = options
        .rate_limiter
        .unwrap_or_else(|| Arc::new(FixedWindowLimiter::new(clock.clone())));

    let dispatcher = Arc::new(
        Dispatcher::builder(licenser.clone())
            .timeout(Duration::from_secs(5))
            .block_list(options.block_list)
            .build()
            .expect("dispatcher builds"),
    );

    let processor = DeliveryProcessor::new(
        endpoints.clone(),
        projects.clone(),
        subscriptions.clone(),
        deliveries.clone(),
        attempts.clone(),
        queuer.clone(),
        rate_limiter,
        breaker,
        dispatcher,
        licenser,
    )
    .with_observer(observer.clone())
    .with_clock(clock.clone())
    .with_ids(Arc::new(SequentialIds::new()));

    Harness {
        processor,
        endpoints,
        projects,
        subscriptions,
        deliveries,
        attempts,
        queuer,
        observer,
        clock,
        breaker_store,
    }
}

impl Harness {
    /// Store the fixture rows.
    pub fn seed(&self, project: &Project, endpoint: &Endpoint, delivery: &EventDelivery) {
        self.projects.insert(project.clone());
        self.endpoints.insert(endpoint.clone());
        self.deliveries.insert(delivery.clone());
    }

    /// Run the processor on a delivery with a fresh cancellation token.
    pub async fn process(&self, delivery: &EventDelivery) -> Result<(), DeliveryError> {
        let job = EventDeliveryJob {
            event_delivery_id: delivery.id,
            project_id: delivery.project_id,
        };
        self.processor.process(&job, &CancellationToken::new()).await
    }
}
