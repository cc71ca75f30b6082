//! Repository contracts and their Postgres implementations.
//!
//! Each repository is a narrow capability set the delivery processor
//! consumes through a trait object, so tests can substitute in-memory
//! implementations without a database. The Postgres implementations read
//! through the replica binding and write through the primary; row ownership
//! stays with the store.

use async_trait::async_trait;
use chrono::Duration;

use courier_core::{EndpointId, EventDeliveryId, ProjectId, SubscriptionId};

use crate::error::DbError;
use crate::models::{
    DeliveryAttempt, Endpoint, EndpointStatus, EventDelivery, EventDeliveryStatus, Project,
    Subscription,
};
use crate::pool::Database;

/// Endpoint lookups and status transitions.
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: EndpointId,
    ) -> Result<Option<Endpoint>, DbError>;

    async fn update_status(
        &self,
        project_id: ProjectId,
        id: EndpointId,
        status: EndpointStatus,
    ) -> Result<(), DbError>;
}

/// Project lookups.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn fetch_by_id(&self, id: ProjectId) -> Result<Option<Project>, DbError>;
}

/// Subscription lookups.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, DbError>;
}

/// Event delivery reads and the processor's two write shapes.
#[async_trait]
pub trait EventDeliveryRepository: Send + Sync {
    /// Load the slim projection used by the hot path.
    async fn find_by_id_slim(
        &self,
        project_id: ProjectId,
        id: EventDeliveryId,
    ) -> Result<Option<EventDelivery>, DbError>;

    async fn update_status(
        &self,
        project_id: ProjectId,
        id: EventDeliveryId,
        status: EventDeliveryStatus,
    ) -> Result<(), DbError>;

    /// Commit status, metadata, description and latency atomically.
    async fn update_metadata(
        &self,
        project_id: ProjectId,
        delivery: &EventDelivery,
    ) -> Result<(), DbError>;

    /// Reclaim deliveries stuck in `status` for longer than `older_than`,
    /// resetting them to `scheduled`. Concurrent callers never receive the
    /// same rows.
    async fn find_stuck_by_status(
        &self,
        status: EventDeliveryStatus,
        older_than: Duration,
        limit: i64,
    ) -> Result<Vec<EventDelivery>, DbError>;
}

/// Attempt evidence writes.
#[async_trait]
pub trait DeliveryAttemptsRepository: Send + Sync {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<(), DbError>;
}

// ---------------------------------------------------------------------------
// Postgres implementations
// ---------------------------------------------------------------------------

/// Postgres-backed [`EndpointRepository`].
#[derive(Clone)]
pub struct PgEndpointRepository {
    db: Database,
}

impl PgEndpointRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EndpointRepository for PgEndpointRepository {
    async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: EndpointId,
    ) -> Result<Option<Endpoint>, DbError> {
        Ok(Endpoint::find_by_id(self.db.reader(), project_id, id).await?)
    }

    async fn update_status(
        &self,
        project_id: ProjectId,
        id: EndpointId,
        status: EndpointStatus,
    ) -> Result<(), DbError> {
        Ok(Endpoint::update_status(self.db.writer(), project_id, id, status).await?)
    }
}

/// Postgres-backed [`ProjectRepository`].
#[derive(Clone)]
pub struct PgProjectRepository {
    db: Database,
}

impl PgProjectRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProjectRepository for PgProjectRepository {
    async fn fetch_by_id(&self, id: ProjectId) -> Result<Option<Project>, DbError> {
        Ok(Project::fetch_by_id(self.db.reader(), id).await?)
    }
}

/// Postgres-backed [`SubscriptionRepository`].
#[derive(Clone)]
pub struct PgSubscriptionRepository {
    db: Database,
}

impl PgSubscriptionRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_by_id(
        &self,
        project_id: ProjectId,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, DbError> {
        Ok(Subscription::find_by_id(self.db.reader(), project_id, id).await?)
    }
}

/// Postgres-backed [`EventDeliveryRepository`].
#[derive(Clone)]
pub struct PgEventDeliveryRepository {
    db: Database,
}

impl PgEventDeliveryRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventDeliveryRepository for PgEventDeliveryRepository {
    async fn find_by_id_slim(
        &self,
        project_id: ProjectId,
        id: EventDeliveryId,
    ) -> Result<Option<EventDelivery>, DbError> {
        Ok(EventDelivery::find_by_id_slim(self.db.reader(), project_id, id).await?)
    }

    async fn update_status(
        &self,
        project_id: ProjectId,
        id: EventDeliveryId,
        status: EventDeliveryStatus,
    ) -> Result<(), DbError> {
        Ok(EventDelivery::update_status(self.db.writer(), project_id, id, status).await?)
    }

    async fn update_metadata(
        &self,
        project_id: ProjectId,
        delivery: &EventDelivery,
    ) -> Result<(), DbError> {
        Ok(EventDelivery::update_metadata(self.db.writer(), project_id, delivery).await?)
    }

    async fn find_stuck_by_status(
        &self,
        status: EventDeliveryStatus,
        older_than: Duration,
        limit: i64,
    ) -> Result<Vec<EventDelivery>, DbError> {
        let cutoff = chrono::Utc::now() - older_than;
        Ok(EventDelivery::find_stuck_by_status(self.db.writer(), status, cutoff, limit).await?)
    }
}

/// Postgres-backed [`DeliveryAttemptsRepository`].
#[derive(Clone)]
pub struct PgDeliveryAttemptsRepository {
    db: Database,
}

impl PgDeliveryAttemptsRepository {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeliveryAttemptsRepository for PgDeliveryAttemptsRepository {
    async fn create(&self, attempt: &DeliveryAttempt) -> Result<(), DbError> {
        Ok(DeliveryAttempt::create(self.db.writer(), attempt).await?)
    }
}
