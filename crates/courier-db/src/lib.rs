//! PostgreSQL persistence for courier.
//!
//! Exposes a connection [`Database`] with a primary (write) binding and an
//! optional read-replica binding, the delivery domain entities with their
//! SQL as associated functions, and narrow repository contracts the
//! delivery processor consumes. Each repository is a small capability set;
//! reads go through the replica binding, writes through the primary.

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod repo;

pub use error::DbError;
pub use pool::{Database, DatabaseOptions};
pub use repo::{
    DeliveryAttemptsRepository, EndpointRepository, EventDeliveryRepository,
    PgDeliveryAttemptsRepository, PgEndpointRepository, PgEventDeliveryRepository,
    PgProjectRepository, PgSubscriptionRepository, ProjectRepository, SubscriptionRepository,
};
