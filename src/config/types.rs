use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for Sumi-Conductor
///
/// Every section is optional; missing sections fall back to conservative
/// defaults (one request per second per domain, three attempts per task).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainRule>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default, rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default, rename = "seed")]
    pub seeds: Vec<SeedEntry>,
}

/// Scheduler and worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of concurrent fetch workers
    pub workers: u32,

    /// Longest the scheduler sleeps when nothing is ready (milliseconds)
    #[serde(rename = "idle-tick-ms")]
    pub idle_tick_ms: u64,

    /// Per-domain state untouched for this long is evicted (seconds)
    #[serde(rename = "idle-eviction-secs")]
    pub idle_eviction_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            idle_tick_ms: 50,
            idle_eviction_secs: 600,
        }
    }
}

impl SchedulerConfig {
    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum dispatches charged to a task (including the first)
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    /// Backoff cap (milliseconds)
    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Proxy failures tolerated per task before it is abandoned
    #[serde(rename = "max-proxy-retries")]
    pub max_proxy_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 32_000,
            max_proxy_retries: 5,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Per-domain circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Weighted failures within the window that open the circuit
    pub threshold: u32,

    /// Sliding failure window (seconds)
    #[serde(rename = "window-secs")]
    pub window_secs: u64,

    /// Initial open duration before a half-open probe (milliseconds)
    #[serde(rename = "open-duration-ms")]
    pub open_duration_ms: u64,

    /// Cap for the open duration after repeated probe failures (milliseconds)
    #[serde(rename = "max-open-duration-ms")]
    pub max_open_duration_ms: u64,

    /// Weight of a rate-limit signal relative to a hard failure
    #[serde(rename = "rate-limit-weight")]
    pub rate_limit_weight: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_secs: 60,
            open_duration_ms: 30_000,
            max_open_duration_ms: 600_000,
            rate_limit_weight: 0.5,
        }
    }
}

impl CircuitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    pub fn max_open_duration(&self) -> Duration {
        Duration::from_millis(self.max_open_duration_ms)
    }
}

/// Default token bucket applied to domains without a matching rule
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Tokens per second
    #[serde(rename = "default-rate")]
    pub default_rate: f64,

    /// Bucket capacity
    #[serde(rename = "default-burst")]
    pub default_burst: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            default_burst: 1,
        }
    }
}

/// Rate rule for a domain pattern (e.g., "example.com" or "*.example.com")
#[derive(Debug, Clone, Deserialize)]
pub struct DomainRule {
    pub pattern: String,

    /// Tokens per second
    pub rate: f64,

    /// Bucket capacity
    pub burst: u32,
}

/// Proxy selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    RoundRobin,
    Random,
    HealthWeighted,
}

/// Proxy pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Fetch without a proxy when no endpoints are configured
    pub direct: bool,

    pub strategy: StrategyKind,

    /// Consecutive failures before an endpoint starts cooling down
    #[serde(rename = "failure-threshold")]
    pub failure_threshold: u32,

    /// First cooldown duration (seconds)
    #[serde(rename = "base-cooldown-secs")]
    pub base_cooldown_secs: u64,

    /// Cooldown cap (seconds)
    #[serde(rename = "max-cooldown-secs")]
    pub max_cooldown_secs: u64,

    /// Proxy addresses (host:port, user:pass@host:port, scheme://...)
    pub endpoints: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            direct: true,
            strategy: StrategyKind::RoundRobin,
            failure_threshold: 3,
            base_cooldown_secs: 30,
            max_cooldown_secs: 900,
            endpoints: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn base_cooldown(&self) -> Duration {
        Duration::from_secs(self.base_cooldown_secs)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            crawler_name: "SumiConductor".to_string(),
            crawler_version: env!("CARGO_PKG_VERSION").to_string(),
            contact_url: "https://example.com/crawler".to_string(),
            contact_email: "crawler@example.com".to_string(),
        }
    }
}

impl UserAgentConfig {
    /// Format: CrawlerName/Version (+ContactURL; ContactEmail)
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Settings passed through to the fetcher
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Request timeout (seconds)
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    /// Extra headers sent with every request
    pub headers: BTreeMap<String, String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            headers: BTreeMap::new(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Seed URL submitted at startup
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub url: String,

    #[serde(default)]
    pub priority: u32,
}
