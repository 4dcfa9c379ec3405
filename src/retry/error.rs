use serde::Serialize;
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Longest server-provided wait hint honored for a single task (1 hour)
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classified outcome of a failed fetch
///
/// Fetchers return one of these; the core never sees raw transport errors.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Timeout, connection reset, 5xx: may succeed later
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The target asked us to slow down, optionally saying for how long
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Explicit denial (authentication required, hard block)
    #[error("permanently blocked: {0}")]
    PermanentBlock(String),

    /// The resource definitively does not exist (404, 410, 400)
    #[error("rejected: {0}")]
    Rejected(String),

    /// The egress proxy failed, not the target
    #[error("proxy error: {0}")]
    Proxy(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork(_) => ErrorKind::TransientNetwork,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::PermanentBlock(_) => ErrorKind::PermanentBlock,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Proxy(_) => ErrorKind::Proxy,
        }
    }

    /// Server-provided wait hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Payload-free classification of a [`FetchError`], reported to callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    PermanentBlock,
    Rejected,
    Proxy,
}

impl ErrorKind {
    /// Whether a task failing with this kind may be dispatched again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork | Self::RateLimited | Self::Proxy)
    }

    /// Whether the failure counts against the task's own attempt budget
    ///
    /// Proxy failures are the egress identity's fault and are refunded.
    pub fn charges_attempt(&self) -> bool {
        !matches!(self, Self::Proxy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::PermanentBlock => "permanent_block",
            Self::Rejected => "rejected",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a `Retry-After` header value
///
/// Accepts delay-seconds or an HTTP-date. Negative or unparseable values give
/// `None`; dates in the past give zero; anything longer than
/// [`MAX_RETRY_AFTER`] is capped.
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    parse_retry_after_at(header_value, SystemTime::now())
}

pub(crate) fn parse_retry_after_at(header_value: &str, now: SystemTime) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            tracing::debug!("Ignoring negative Retry-After value {}", seconds);
            return None;
        }
        return Some(cap_retry_after(Duration::from_secs(seconds as u64)));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(date) => Some(
            date.duration_since(now)
                .map(cap_retry_after)
                .unwrap_or(Duration::ZERO),
        ),
        Err(_) => {
            tracing::debug!("Unparseable Retry-After value '{}'", header_value);
            None
        }
    }
}

fn cap_retry_after(delay: Duration) -> Duration {
    if delay > MAX_RETRY_AFTER {
        tracing::warn!(
            "Retry-After of {}s exceeds maximum, capping at {}s",
            delay.as_secs(),
            MAX_RETRY_AFTER.as_secs()
        );
        MAX_RETRY_AFTER
    } else {
        delay
    }
}
