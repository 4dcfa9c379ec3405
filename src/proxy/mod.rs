//! Proxy pool with health tracking and cooldowns
//!
//! This module handles:
//! - Parsing proxy addresses from configuration
//! - Pluggable endpoint selection ([`SelectionStrategy`])
//! - Consecutive-failure tracking with exponential cooldowns
//! - Lease-based in-use accounting ([`ProxyLease`])
//!
//! An endpoint in cooldown is never selected while any other endpoint is
//! eligible. When the whole pool is cooling down the endpoint whose cooldown
//! ends first is returned instead of failing.

mod address;
mod strategy;

pub use address::{ProxyAddress, ProxyScheme};
pub use strategy::{strategy_for, Candidate, HealthWeighted, Random, RoundRobin, SelectionStrategy};

use crate::config::ProxyConfig;
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::{ConductorError, ConfigError, ConfigResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Health {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    successes: u64,
    failures: u64,
    total_latency: Duration,
}

impl Health {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.5
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn avg_latency(&self) -> Option<Duration> {
        (self.successes > 0).then(|| self.total_latency / self.successes as u32)
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug)]
struct Endpoint {
    address: ProxyAddress,
    id: String,
    health: Mutex<Health>,
    in_use: AtomicUsize,
}

impl Endpoint {
    fn new(address: ProxyAddress) -> Self {
        Self {
            id: address.to_string(),
            address,
            health: Mutex::new(Health::default()),
            in_use: AtomicUsize::new(0),
        }
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Default)]
struct Pool {
    endpoints: Vec<Arc<Endpoint>>,
    by_id: HashMap<String, usize>,
}

impl Pool {
    fn new(endpoints: Vec<Arc<Endpoint>>) -> Self {
        let by_id = endpoints
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        Self { endpoints, by_id }
    }

    fn get(&self, id: &str) -> Option<&Arc<Endpoint>> {
        self.by_id.get(id).map(|&i| &self.endpoints[i])
    }
}

#[derive(Debug, Clone)]
struct CooldownSettings {
    failure_threshold: u32,
    base: Duration,
    max: Duration,
}

impl CooldownSettings {
    /// `min(max, base * 2^(failures - threshold))` once at or past the threshold
    fn cooldown_for(&self, consecutive_failures: u32) -> Option<Duration> {
        if consecutive_failures < self.failure_threshold {
            return None;
        }
        let exponent = (consecutive_failures - self.failure_threshold).min(31);
        Some(self.base.saturating_mul(1u32 << exponent).min(self.max))
    }
}

impl From<&ProxyConfig> for CooldownSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            base: config.base_cooldown(),
            max: config.max_cooldown(),
        }
    }
}

/// A selected endpoint; counts as "in use" until dropped
pub struct ProxyLease {
    endpoint: Arc<Endpoint>,
}

impl ProxyLease {
    fn new(endpoint: Arc<Endpoint>) -> Self {
        endpoint.in_use.fetch_add(1, Ordering::SeqCst);
        Self { endpoint }
    }

    /// Stable identifier (redacted address) used for reporting outcomes
    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn address(&self) -> &ProxyAddress {
        &self.endpoint.address
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        self.endpoint.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProxyLease").field(&self.endpoint.id).finish()
    }
}

/// Health snapshot of one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyStats {
    pub id: String,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
    pub in_use: usize,
}

/// Rotating pool of proxy endpoints
pub struct ProxyRotator {
    pool: RwLock<Arc<Pool>>,
    strategy: RwLock<Arc<dyn SelectionStrategy>>,
    settings: RwLock<CooldownSettings>,
    direct: RwLock<bool>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for ProxyRotator {
    fn default() -> Self {
        Self::new(
            Vec::new(),
            Arc::new(RoundRobin::default()),
            &ProxyConfig::default(),
            Arc::new(NoopMetrics),
        )
    }
}

impl ProxyRotator {
    pub fn new(
        addresses: Vec<ProxyAddress>,
        strategy: Arc<dyn SelectionStrategy>,
        config: &ProxyConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let endpoints = addresses
            .into_iter()
            .map(|a| Arc::new(Endpoint::new(a)))
            .collect();
        Self {
            pool: RwLock::new(Arc::new(Pool::new(endpoints))),
            strategy: RwLock::new(strategy),
            settings: RwLock::new(CooldownSettings::from(config)),
            direct: RwLock::new(config.direct),
            metrics,
        }
    }

    /// Builds the pool described by `[proxy]`
    ///
    /// # Errors
    ///
    /// * `InvalidProxy` - An endpoint address does not parse
    /// * `NoProxies` - No endpoints and direct fetching is disabled
    pub fn from_config(config: &ProxyConfig, metrics: Arc<dyn MetricsSink>) -> ConfigResult<Self> {
        let addresses = config
            .endpoints
            .iter()
            .map(|raw| ProxyAddress::parse(raw))
            .collect::<ConfigResult<Vec<_>>>()?;
        if addresses.is_empty() && !config.direct {
            return Err(ConfigError::NoProxies);
        }
        let strategy: Arc<dyn SelectionStrategy> = Arc::from(strategy_for(config.strategy));
        tracing::info!(
            "Proxy pool: {} endpoint(s), strategy {}",
            addresses.len(),
            strategy.name()
        );
        Ok(Self::new(addresses, strategy, config, metrics))
    }

    /// Applies a reloaded `[proxy]` section
    ///
    /// Unparseable endpoints are skipped and reported. If nothing usable
    /// remains and direct fetching is disabled, the previous pool is kept and
    /// `NoProxies` is reported. Endpoints present in both pools keep their
    /// health history.
    pub fn reload(&self, config: &ProxyConfig) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut addresses = Vec::new();
        for raw in &config.endpoints {
            match ProxyAddress::parse(raw) {
                Ok(address) => addresses.push(address),
                Err(e) => {
                    tracing::error!("Skipping proxy endpoint: {}", e);
                    errors.push(e);
                }
            }
        }

        if addresses.is_empty() && !config.direct {
            tracing::error!("Reloaded proxy pool is unusable, keeping the previous pool");
            errors.push(ConfigError::NoProxies);
            return errors;
        }

        let old = self.pool_snapshot();
        let endpoints = addresses
            .into_iter()
            .map(|address| {
                old.get(&address.to_string())
                    .cloned()
                    .unwrap_or_else(|| Arc::new(Endpoint::new(address)))
            })
            .collect();

        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(Pool::new(endpoints));
        *self.strategy.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::from(strategy_for(config.strategy));
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = CooldownSettings::from(config);
        *self.direct.write().unwrap_or_else(|e| e.into_inner()) = config.direct;
        errors
    }

    fn pool_snapshot(&self) -> Arc<Pool> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn settings(&self) -> CooldownSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.pool_snapshot().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when fetches go out without a proxy (empty pool, direct allowed)
    pub fn is_direct(&self) -> bool {
        self.is_empty() && *self.direct.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Selects an endpoint for a fetch to `domain`
    pub fn select(&self, domain: &str) -> crate::Result<ProxyLease> {
        self.select_avoiding(domain, Instant::now(), None)
    }

    /// Selects an endpoint, preferring one other than `avoid`
    ///
    /// # Errors
    ///
    /// `NoProxyAvailable` if the pool is empty
    pub fn select_avoiding(
        &self,
        domain: &str,
        now: Instant,
        avoid: Option<&str>,
    ) -> crate::Result<ProxyLease> {
        let pool = self.pool_snapshot();
        if pool.endpoints.is_empty() {
            self.metrics
                .increment(names::PROXY_UNAVAILABLE, &[("domain", domain)]);
            return Err(ConductorError::NoProxyAvailable {
                domain: domain.to_string(),
            });
        }

        let eligible: Vec<(&Arc<Endpoint>, f64, Option<Duration>)> = pool
            .endpoints
            .iter()
            .filter_map(|e| {
                let health = e.health();
                if health.cooling_down(now) {
                    return None;
                }
                let entry = (e, health.success_rate(), health.avg_latency());
                Some(entry)
            })
            .collect();

        if eligible.is_empty() {
            return Ok(self.degraded(&pool, domain));
        }

        let preferred: Vec<_> = match avoid {
            Some(id) if eligible.iter().any(|(e, _, _)| e.id != id) => eligible
                .into_iter()
                .filter(|(e, _, _)| e.id != id)
                .collect(),
            _ => eligible,
        };

        let candidates: Vec<Candidate<'_>> = preferred
            .iter()
            .map(|(e, success_rate, avg_latency)| Candidate {
                address: &e.address,
                success_rate: *success_rate,
                avg_latency: *avg_latency,
                in_use: e.in_use.load(Ordering::SeqCst),
            })
            .collect();

        let strategy = self
            .strategy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let pick = strategy.choose(&candidates).min(preferred.len() - 1);
        let endpoint = preferred[pick].0.clone();
        tracing::trace!("Selected proxy {} for {}", endpoint.id, domain);
        Ok(ProxyLease::new(endpoint))
    }

    /// Whole pool cooling down: the endpoint that recovers first
    fn degraded(&self, pool: &Pool, domain: &str) -> ProxyLease {
        let endpoint = pool
            .endpoints
            .iter()
            .min_by_key(|e| e.health().cooldown_until)
            .cloned()
            .unwrap_or_else(|| pool.endpoints[0].clone());
        tracing::warn!(
            "All {} proxies cooling down, using {} for {}",
            pool.endpoints.len(),
            endpoint.id,
            domain
        );
        ProxyLease::new(endpoint)
    }

    /// Records a successful fetch through `id`; resets its failure streak
    pub fn report_success(&self, id: &str, latency: Duration) {
        let pool = self.pool_snapshot();
        if let Some(endpoint) = pool.get(id) {
            let mut health = endpoint.health();
            health.consecutive_failures = 0;
            health.cooldown_until = None;
            health.successes += 1;
            health.total_latency += latency;
        }
    }

    /// Records a proxy failure through `id`
    ///
    /// # Returns
    ///
    /// The cooldown applied, if the endpoint reached the failure threshold
    pub fn report_failure(&self, id: &str, now: Instant) -> Option<Duration> {
        let pool = self.pool_snapshot();
        let endpoint = pool.get(id)?;
        let settings = self.settings();

        let cooldown = {
            let mut health = endpoint.health();
            health.consecutive_failures += 1;
            health.failures += 1;
            let cooldown = settings.cooldown_for(health.consecutive_failures);
            if let Some(cooldown) = cooldown {
                health.cooldown_until = Some(now + cooldown);
            }
            cooldown
        };

        if let Some(cooldown) = cooldown {
            tracing::warn!(
                "Proxy {} cooling down for {}s",
                endpoint.id,
                cooldown.as_secs()
            );
            self.metrics
                .increment(names::PROXY_COOLDOWN, &[("proxy", endpoint.id.as_str())]);
        }
        cooldown
    }

    /// When `id` leaves cooldown, if it is cooling down
    pub fn cooldown_until(&self, id: &str) -> Option<Instant> {
        self.pool_snapshot()
            .get(id)
            .and_then(|e| e.health().cooldown_until)
    }

    pub fn stats(&self) -> Vec<ProxyStats> {
        let now = Instant::now();
        self.pool_snapshot()
            .endpoints
            .iter()
            .map(|e| {
                let health = e.health();
                ProxyStats {
                    id: e.id.clone(),
                    successes: health.successes,
                    failures: health.failures,
                    success_rate: health.success_rate(),
                    avg_latency: health.avg_latency(),
                    consecutive_failures: health.consecutive_failures,
                    cooling_down: health.cooling_down(now),
                    in_use: e.in_use.load(Ordering::SeqCst),
                }
            })
            .collect()
    }
}
