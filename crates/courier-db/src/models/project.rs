//! Project entity and per-project delivery configuration.
//!
//! The project config is the authoritative fallback for every policy the
//! processor applies: signature scheme, retry strategy, rate limits, SSL
//! enforcement and the disable-endpoint policy. Subscriptions and endpoints
//! may override parts of it (see `courier-delivery`'s config resolution).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use courier_core::ProjectId;

/// Hash function used for a signature version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureHash {
    Sha256,
    Sha512,
}

/// Digest encoding used for a signature version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// One signature version. Versions are ordered; the first is the active one
/// for new subscribers, but every configured version is sent so that
/// subscribers can roll keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureVersion {
    pub hash: SignatureHash,
    pub encoding: SignatureEncoding,
    /// Optional header-name override. Versions without one share the
    /// project's signature header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

/// Signature configuration for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfiguration {
    /// Default signature header name.
    pub header: String,
    pub versions: Vec<SignatureVersion>,
}

impl Default for SignatureConfiguration {
    fn default() -> Self {
        Self {
            header: "X-Courier-Signature".to_string(),
            versions: vec![SignatureVersion {
                hash: SignatureHash::Sha256,
                encoding: SignatureEncoding::Hex,
                header: None,
            }],
        }
    }
}

/// Retry strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Linear,
    Exponential,
}

/// Retry strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfiguration {
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    /// Base interval in seconds.
    pub duration: u64,
    pub retry_count: u64,
    /// Cap for exponential backoff, in seconds.
    #[serde(default = "default_max_retry_seconds")]
    pub max_retry_seconds: u64,
}

fn default_max_retry_seconds() -> u64 {
    7200
}

impl Default for StrategyConfiguration {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Linear,
            duration: 100,
            retry_count: 10,
            max_retry_seconds: default_max_retry_seconds(),
        }
    }
}

/// Rate limit configuration: `count` requests per `duration` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfiguration {
    pub count: u32,
    pub duration: u64,
}

impl Default for RateLimitConfiguration {
    fn default() -> Self {
        Self {
            count: 1000,
            duration: 60,
        }
    }
}

/// TLS policy for outbound dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SslConfiguration {
    /// When true, certificate verification failures fail the dispatch.
    pub enforce_secure_endpoints: bool,
}

impl Default for SslConfiguration {
    fn default() -> Self {
        Self {
            enforce_secure_endpoints: true,
        }
    }
}

/// Per-project delivery configuration, stored as JSONB.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub signature: SignatureConfiguration,
    #[serde(default)]
    pub strategy: StrategyConfiguration,
    #[serde(default)]
    pub rate_limit: RateLimitConfiguration,
    #[serde(default)]
    pub ssl: SslConfiguration,
    /// When true, exhausting the retry budget disables the endpoint.
    #[serde(default)]
    pub disable_endpoint: bool,
    /// Retention window for delivery history, e.g. "720h". Enforced by the
    /// retention task, stored here for completeness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,
}

/// Database entity for a project.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub config: Json<ProjectConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Fetch a project by id.
    pub async fn fetch_by_id(pool: &PgPool, id: ProjectId) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM projects
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}
