//! Outbound HTTP dispatch.
//!
//! Executes one delivery attempt: resolves the destination, enforces the
//! IP allow/block policy (when licensed), and performs the POST with a
//! wall-clock timeout, bounded redirects, an optional forward proxy and a
//! per-project TLS policy. Transport failures are folded into a small error
//! taxonomy the processor turns into human-readable failure descriptions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::licenser::Licenser;

/// Default wall-clock timeout for one dispatch.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Redirects followed before the dispatch is failed.
pub const MAX_REDIRECTS: usize = 5;

/// Default cap on the subscriber's response body.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 51_200;

/// Dispatch failure taxonomy. Returned to the processor, never surfaced to
/// the subscriber.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// DNS, TCP or TLS level failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("destination ip {ip} is blocked by policy")]
    BlockedIp { ip: IpAddr },

    #[error("redirect limit exceeded")]
    RedirectExceeded,

    #[error("response larger than {limit} bytes")]
    ResponseTooLarge { limit: usize },

    /// The dispatch was aborted by cancellation. The display form is the
    /// error string recorded on the attempt.
    #[error("cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("failed to build http client: {0}")]
    ClientBuild(String),

    #[error("invalid cidr: {0}")]
    InvalidCidr(String),

    #[error("invalid proxy url: {0}")]
    InvalidProxy(String),
}

impl DispatchError {
    /// Whether the destination was rejected by IP policy (a discard, not a
    /// retryable failure).
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::BlockedIp { .. })
    }
}

/// One outbound request, fully built by the processor.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The captured subscriber response.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Resolved destination address, when resolution happened.
    pub ip_address: Option<IpAddr>,
}

impl DispatchResponse {
    /// Whether the subscriber accepted the delivery.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `Retry-After` header value, when present.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
            .map(|(_, value)| value.as_str())
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    licenser: Arc<dyn Licenser>,
    timeout: Duration,
    proxy: Option<String>,
    block_list: Vec<String>,
    allow_list: Vec<String>,
    max_response_bytes: usize,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forward proxy URL. Only applied when the license permits it.
    #[must_use]
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(url.into());
        self
    }

    /// CIDRs that destinations must not resolve into.
    #[must_use]
    pub fn block_list<I, S>(mut self, cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.block_list = cidrs.into_iter().map(Into::into).collect();
        self
    }

    /// CIDRs that destinations must resolve into, when non-empty.
    #[must_use]
    pub fn allow_list<I, S>(mut self, cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list = cidrs.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    /// Build the dispatcher and its HTTP clients.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::InvalidCidr`, `InvalidProxy` or
    /// `ClientBuild` when configuration cannot be applied.
    pub fn build(self) -> Result<Dispatcher, DispatchError> {
        let block_list = parse_cidrs(&self.block_list)?;
        let allow_list = parse_cidrs(&self.allow_list)?;

        let proxy = match &self.proxy {
            Some(url) if self.licenser.use_forward_proxy() => Some(
                reqwest::Proxy::all(url)
                    .map_err(|e| DispatchError::InvalidProxy(format!("{url}: {e}")))?,
            ),
            _ => None,
        };

        let client = build_client(self.timeout, proxy.clone(), false)?;
        let insecure_client = build_client(self.timeout, proxy, true)?;

        Ok(Dispatcher {
            licenser: self.licenser,
            client,
            insecure_client,
            timeout: self.timeout,
            block_list,
            allow_list,
            max_response_bytes: self.max_response_bytes,
        })
    }
}

fn parse_cidrs(cidrs: &[String]) -> Result<Vec<IpNetwork>, DispatchError> {
    cidrs
        .iter()
        .map(|c| {
            c.parse::<IpNetwork>()
                .map_err(|e| DispatchError::InvalidCidr(format!("{c}: {e}")))
        })
        .collect()
}

fn build_client(
    timeout: Duration,
    proxy: Option<reqwest::Proxy>,
    accept_invalid_certs: bool,
) -> Result<Client, DispatchError> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .danger_accept_invalid_certs(accept_invalid_certs);

    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| DispatchError::ClientBuild(e.to_string()))
}

/// Performs one outbound request per delivery attempt.
pub struct Dispatcher {
    licenser: Arc<dyn Licenser>,
    client: Client,
    insecure_client: Client,
    timeout: Duration,
    block_list: Vec<IpNetwork>,
    allow_list: Vec<IpNetwork>,
    max_response_bytes: usize,
}

impl Dispatcher {
    /// Start building a dispatcher.
    #[must_use]
    pub fn builder(licenser: Arc<dyn Licenser>) -> DispatcherBuilder {
        DispatcherBuilder {
            licenser,
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
            block_list: Vec::new(),
            allow_list: Vec::new(),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    /// Resolve the destination of `url` and apply the IP policy.
    ///
    /// Returns the resolved address, or `None` when IP rules are not
    /// licensed (no resolution is attempted then).
    ///
    /// # Errors
    ///
    /// `DispatchError::BlockedIp` when the destination violates the policy,
    /// `InvalidUrl`/`Transport` when it cannot be resolved.
    pub async fn check_destination(&self, url: &str) -> Result<Option<IpAddr>, DispatchError> {
        if !self.licenser.ip_rules() {
            return Ok(None);
        }

        let parsed = Url::parse(url).map_err(|e| DispatchError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DispatchError::InvalidUrl(format!("{url} has no host")))?;
        let port = parsed.port_or_known_default().unwrap_or(443);

        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| DispatchError::Transport(format!("dns lookup for {host}: {e}")))?
                .next()
                .map(|addr| addr.ip())
                .ok_or_else(|| {
                    DispatchError::Transport(format!("dns lookup for {host}: no addresses"))
                })?,
        };

        if self.is_denied(ip) {
            return Err(DispatchError::BlockedIp { ip });
        }

        Ok(Some(ip))
    }

    fn is_denied(&self, ip: IpAddr) -> bool {
        if self.block_list.iter().any(|net| net.contains(ip)) {
            return true;
        }
        !self.allow_list.is_empty() && !self.allow_list.iter().any(|net| net.contains(ip))
    }

    /// Execute one POST.
    ///
    /// `verify_tls` selects the TLS policy for this request (from the
    /// project's SSL config). A cancelled token aborts the in-flight call
    /// with `DispatchError::Cancelled`.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        verify_tls: bool,
        cancel: &CancellationToken,
    ) -> Result<DispatchResponse, DispatchError> {
        let ip_address = self.check_destination(&request.url).await?;

        let headers = header_map(&request.headers);
        let client = if verify_tls {
            &self.client
        } else {
            &self.insecure_client
        };

        let send = async {
            let response = client
                .post(&request.url)
                .headers(headers)
                .body(request.body)
                .send()
                .await
                .map_err(|e| self.map_send_error(&e))?;

            let status = response.status().as_u16();

            if let Some(length) = response.content_length() {
                if length as usize > self.max_response_bytes {
                    return Err(DispatchError::ResponseTooLarge {
                        limit: self.max_response_bytes,
                    });
                }
            }

            let response_headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.to_string(), v.to_string()))
                })
                .collect();

            let mut body = response
                .bytes()
                .await
                .map_err(|e| self.map_send_error(&e))?
                .to_vec();
            body.truncate(self.max_response_bytes);

            Ok(DispatchResponse {
                status,
                headers: response_headers,
                body,
                ip_address,
            })
        };

        tokio::select! {
            () = cancel.cancelled() => Err(DispatchError::Cancelled),
            result = send => result,
        }
    }

    fn map_send_error(&self, error: &reqwest::Error) -> DispatchError {
        if error.is_timeout() {
            DispatchError::Timeout(self.timeout)
        } else if error.is_redirect() {
            DispatchError::RedirectExceeded
        } else {
            DispatchError::Transport(error.to_string())
        }
    }
}

/// Convert name/value pairs into a `HeaderMap`, skipping entries that are
/// not valid header names or values.
fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => {
                tracing::warn!(
                    target: "delivery",
                    header = %name,
                    "Skipping invalid outbound header"
                );
            }
        }
    }
    map
}
