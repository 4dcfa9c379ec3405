//! Sumi-Conductor: a polite crawl orchestration core
//!
//! This crate turns a stream of candidate URLs into politely paced,
//! fault-tolerant, proxy-diversified fetch attempts. It decides *when*,
//! *through which identity* and *how many times* an opaque fetch is attempted;
//! the fetch itself is delegated to a [`crawler::Fetcher`].

pub mod budget;
pub mod circuit;
pub mod config;
pub mod crawler;
pub mod frontier;
pub mod metrics;
pub mod output;
pub mod proxy;
pub mod retry;
pub mod state;
pub mod url;

use thiserror::Error;

/// Main error type for Sumi-Conductor operations
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid task {url}: {reason}")]
    InvalidTask { url: String, reason: String },

    #[error("No proxy available for {domain}")]
    NoProxyAvailable { domain: String },

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
///
/// These are the only errors that surface at the operator boundary (startup
/// and reload); everything that happens to a single fetch is classified at the
/// worker boundary instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid domain pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid rate for domain {domain}: {reason}")]
    InvalidDomainRate { domain: String, reason: String },

    #[error("Invalid proxy address '{address}': {reason}")]
    InvalidProxy { address: String, reason: String },

    #[error("No usable proxies configured")]
    NoProxies,
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Sumi-Conductor operations
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{
    FetchError, FetchResponse, Fetcher, HttpFetcher, Orchestrator, ResultCallback, TaskReport,
};
pub use frontier::{Frontier, UrlTask};
pub use metrics::{InMemoryMetrics, MetricsSink};
pub use retry::ErrorKind;
pub use state::TaskState;
pub use url::{extract_domain, normalize_url};
