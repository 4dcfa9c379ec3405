use crate::config::types::{
    BudgetConfig, CircuitConfig, Config, DomainRule, ProxyConfig, RetryConfig, SchedulerConfig,
    SeedEntry, UserAgentConfig,
};
use crate::proxy::ProxyAddress;
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
///
/// Per-domain rates are not checked here: a bad `[[domain]]`
/// rate disables that domain when the table is built instead of rejecting
/// the whole file. Use [`validate_domain_rule`] to check one up front.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scheduler_config(&config.scheduler)?;
    validate_retry_config(&config.retry)?;
    validate_circuit_config(&config.circuit)?;
    validate_budget_config(&config.budget)?;
    for rule in &config.domains {
        validate_domain_pattern(&rule.pattern)?;
    }
    validate_proxy_config(&config.proxy)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_seeds(&config.seeds)?;
    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.workers < 1 || config.workers > 1024 {
        return Err(ConfigError::Validation(format!(
            "workers must be between 1 and 1024, got {}",
            config.workers
        )));
    }

    if config.idle_tick_ms < 1 {
        return Err(ConfigError::Validation(
            "idle-tick-ms must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max-attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.max_delay_ms < config.base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "max-delay-ms ({}) must be >= base-delay-ms ({})",
            config.max_delay_ms, config.base_delay_ms
        )));
    }

    Ok(())
}

fn validate_circuit_config(config: &CircuitConfig) -> Result<(), ConfigError> {
    if config.threshold < 1 {
        return Err(ConfigError::Validation(
            "circuit threshold must be >= 1".to_string(),
        ));
    }

    if config.window_secs < 1 {
        return Err(ConfigError::Validation(
            "circuit window-secs must be >= 1".to_string(),
        ));
    }

    if config.open_duration_ms < 1 || config.max_open_duration_ms < config.open_duration_ms {
        return Err(ConfigError::Validation(format!(
            "circuit open durations must satisfy 0 < open-duration-ms ({}) <= max-open-duration-ms ({})",
            config.open_duration_ms, config.max_open_duration_ms
        )));
    }

    if !(config.rate_limit_weight > 0.0 && config.rate_limit_weight <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "rate-limit-weight must be in (0, 1], got {}",
            config.rate_limit_weight
        )));
    }

    Ok(())
}

fn validate_budget_config(config: &BudgetConfig) -> Result<(), ConfigError> {
    check_rate(config.default_rate, config.default_burst)
        .map_err(|reason| ConfigError::Validation(format!("default budget: {}", reason)))
}

/// Validates the rate and burst of a single domain rule
pub fn validate_domain_rule(rule: &DomainRule) -> Result<(), ConfigError> {
    check_rate(rule.rate, rule.burst).map_err(|reason| ConfigError::InvalidDomainRate {
        domain: rule.pattern.clone(),
        reason,
    })
}

pub(crate) fn check_rate(rate: f64, burst: u32) -> Result<(), String> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(format!("rate must be a positive number, got {}", rate));
    }

    if burst < 1 {
        return Err(format!("burst must be >= 1, got {}", burst));
    }

    Ok(())
}

fn validate_proxy_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    if config.failure_threshold < 1 {
        return Err(ConfigError::Validation(
            "proxy failure-threshold must be >= 1".to_string(),
        ));
    }

    if config.max_cooldown_secs < config.base_cooldown_secs {
        return Err(ConfigError::Validation(format!(
            "max-cooldown-secs ({}) must be >= base-cooldown-secs ({})",
            config.max_cooldown_secs, config.base_cooldown_secs
        )));
    }

    for endpoint in &config.endpoints {
        ProxyAddress::parse(endpoint)?;
    }

    if config.endpoints.is_empty() && !config.direct {
        return Err(ConfigError::NoProxies);
    }

    Ok(())
}

fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

fn validate_seeds(seeds: &[SeedEntry]) -> Result<(), ConfigError> {
    for seed in seeds {
        let url = Url::parse(&seed.url).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed.url, e))
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(format!(
                "Seed URL '{}' must use HTTP or HTTPS",
                seed.url
            )));
        }
    }

    Ok(())
}

/// Validates a domain pattern (supports wildcards)
pub fn validate_domain_pattern(pattern: &str) -> Result<(), ConfigError> {
    if pattern.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Domain pattern cannot be empty".to_string(),
        ));
    }

    match pattern.strip_prefix("*.") {
        Some(domain) => validate_domain_string(domain),
        None => validate_domain_string(pattern),
    }
}

/// Validates a domain string (without wildcard prefix)
fn validate_domain_string(domain: &str) -> Result<(), ConfigError> {
    if domain.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Domain cannot be empty".to_string(),
        ));
    }

    if !domain
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' contains invalid characters",
            domain
        )));
    }

    if domain.starts_with('.')
        || domain.ends_with('.')
        || domain.starts_with('-')
        || domain.ends_with('-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' cannot start or end with '.' or '-'",
            domain
        )));
    }

    if domain.contains("..") {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' cannot contain consecutive dots",
            domain
        )));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
