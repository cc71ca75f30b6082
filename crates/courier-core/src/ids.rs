//! Strongly Typed Identifiers
//!
//! Newtype UUID identifiers for the delivery domain. The newtype pattern
//! prevents accidental misuse of different ID types at compile time: a
//! function that expects an [`EndpointId`] will not accept a [`ProjectId`].
//!
//! # Example
//!
//! ```
//! use courier_core::{EndpointId, ProjectId};
//!
//! let project = ProjectId::new();
//! let endpoint = EndpointId::new();
//!
//! fn requires_project(id: ProjectId) -> String {
//!     id.to_string()
//! }
//!
//! let _ = requires_project(project);
//! // requires_project(endpoint); // This would not compile!
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Error type for ID parsing failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse
    pub id_type: &'static str,
    /// The underlying UUID parse error message
    pub message: String,
}

impl Display for ParseIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to parse {}: {}", self.id_type, self.message)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to define a strongly-typed ID type
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random ID using UUID v4.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an ID from an existing UUID.
            #[must_use]
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns a reference to the underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        message: e.to_string(),
                    })
            }
        }
    };
}

define_id!(
    /// Identifier for a project, the ownership boundary for endpoints,
    /// subscriptions and deliveries.
    ProjectId
);

define_id!(
    /// Identifier for a delivery endpoint (a subscriber's URL plus its
    /// secrets and policy).
    EndpointId
);

define_id!(
    /// Identifier for an upstream event.
    EventId
);

define_id!(
    /// Identifier for one (event, endpoint) delivery with its own retry
    /// budget.
    EventDeliveryId
);

define_id!(
    /// Identifier for a subscription binding an event filter to an endpoint.
    SubscriptionId
);

define_id!(
    /// Identifier for a single persisted HTTP dispatch attempt.
    DeliveryAttemptId
);
