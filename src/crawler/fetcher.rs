//! Fetcher interface and the reqwest-backed implementation
//!
//! The core treats fetching as an opaque capability: it hands a URL, an
//! optional proxy and a header set to a [`Fetcher`] and receives either a
//! [`FetchResponse`] or a classified [`FetchError`]. [`HttpFetcher`] is the
//! implementation used by the binary. It maps HTTP and transport outcomes onto
//! the error taxonomy:
//!
//! | Outcome | Classification |
//! |---------|----------------|
//! | 2xx | success |
//! | 429, 503 with `Retry-After` | RateLimited (with hint) |
//! | 401, 403, 451 | PermanentBlock |
//! | 407 | Proxy |
//! | 408 | TransientNetwork |
//! | other 4xx (404, 410, 400, ...) | Rejected |
//! | 5xx, timeout, connection reset | TransientNetwork |
//! | connect failure through a proxy | Proxy |

use crate::config::{FetchConfig, UserAgentConfig};
use crate::proxy::ProxyAddress;
use crate::retry::{parse_retry_after, FetchError};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;

/// Extra request headers
pub type Headers = BTreeMap<String, String>;

/// Maximum redirect hops followed by [`HttpFetcher`]
const MAX_REDIRECTS: usize = 10;

/// A successful fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// Final URL after redirects
    pub final_url: String,

    pub status_code: u16,

    pub content_type: Option<String>,

    pub body: String,
}

/// Performs one fetch attempt
///
/// Implementations must classify every failure; they are called from worker
/// tasks and never see scheduling state.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyAddress>,
        headers: &Headers,
    ) -> Result<FetchResponse, FetchError>;
}

/// Builds an HTTP client with the crawler's user agent
///
/// # Arguments
///
/// * `user_agent` - Identification sent with every request
/// * `timeout` - Whole-request timeout
/// * `proxy` - Route every request through this proxy
pub fn build_http_client(
    user_agent: &UserAgentConfig,
    timeout: Duration,
    proxy: Option<&ProxyAddress>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(user_agent.header_value())
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.to_url())?);
    }

    builder.build()
}

/// [`Fetcher`] backed by `reqwest`, with one client per proxy endpoint
pub struct HttpFetcher {
    user_agent: UserAgentConfig,
    timeout: Duration,
    clients: DashMap<String, Client>,
}

impl HttpFetcher {
    pub fn new(user_agent: UserAgentConfig, fetch: &FetchConfig) -> Self {
        Self {
            user_agent,
            timeout: fetch.timeout(),
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, proxy: Option<&ProxyAddress>) -> Result<Client, FetchError> {
        let key = proxy.map(|p| p.to_string()).unwrap_or_default();
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_http_client(&self.user_agent, self.timeout, proxy).map_err(|e| {
            match proxy {
                Some(p) => FetchError::Proxy(format!("cannot use proxy {}: {}", p, e)),
                None => FetchError::TransientNetwork(format!("cannot build client: {}", e)),
            }
        })?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyAddress>,
        headers: &Headers,
    ) -> Result<FetchResponse, FetchError> {
        let client = self.client_for(proxy)?;
        let response = client
            .get(url)
            .headers(header_map(headers))
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, proxy.is_some()))?;

        let status = response.status();
        if let Some(error) = classify_status(status, response.headers()) {
            tracing::debug!("{} -> {} ({})", url, status.as_u16(), error.kind());
            return Err(error);
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::TransientNetwork(format!("failed to read body: {}", e)))?;

        Ok(FetchResponse {
            final_url,
            status_code: status.as_u16(),
            content_type,
            body,
        })
    }
}

fn header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::warn!("Skipping invalid header '{}'", name),
        }
    }
    map
}

/// Maps a response status to a fetch error; `None` means success
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }

    let retry_after = || {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
    };
    let code = status.as_u16();

    let error = match code {
        429 => FetchError::RateLimited {
            retry_after: retry_after(),
        },
        503 => match retry_after() {
            Some(hint) => FetchError::RateLimited {
                retry_after: Some(hint),
            },
            None => FetchError::TransientNetwork(format!("HTTP {}", code)),
        },
        401 | 403 | 451 => FetchError::PermanentBlock(format!("HTTP {}", code)),
        407 => FetchError::Proxy("proxy authentication required (HTTP 407)".to_string()),
        408 => FetchError::TransientNetwork(format!("HTTP {}", code)),
        400..=499 => FetchError::Rejected(format!("HTTP {}", code)),
        _ => FetchError::TransientNetwork(format!("HTTP {}", code)),
    };
    Some(error)
}

/// Maps a transport-level reqwest error to a fetch error
fn classify_transport_error(error: &reqwest::Error, via_proxy: bool) -> FetchError {
    if error.is_timeout() {
        FetchError::TransientNetwork("request timeout".to_string())
    } else if error.is_connect() && via_proxy {
        FetchError::Proxy(format!("proxy connection failed: {}", error))
    } else if error.is_redirect() {
        FetchError::Rejected(format!("redirect error: {}", error))
    } else {
        FetchError::TransientNetwork(error.to_string())
    }
}
