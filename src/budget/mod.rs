//! Per-domain token-bucket request budgets
//!
//! Each domain gets a bucket that refills continuously at `rate` tokens per
//! second up to `burst`. [`DomainBudget::acquire`] never waits: it either
//! spends a token or reports how long until one accrues, and the scheduler
//! decides what to do with that.
//!
//! Bucket parameters resolve in this order:
//! 1. An explicit [`DomainBudget::configure`] call for the exact domain
//! 2. The most specific `[[domain]]` rule matching the domain
//! 3. The default rate
//!
//! A rule with an invalid rate disables its domains instead of failing the
//! whole table; disabled domains are never admitted.

use crate::config::{check_rate, BudgetConfig, DomainRule};
use crate::metrics::{names, MetricsSink, NoopMetrics};
use crate::url::{most_specific, DomainPattern};
use crate::{ConfigError, ConfigResult};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Rate and capacity of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Tokens per second
    pub rate: f64,

    /// Bucket capacity
    pub burst: u32,
}

impl BucketSpec {
    pub fn new(rate: f64, burst: u32) -> ConfigResult<Self> {
        check_rate(rate, burst).map_err(ConfigError::Validation)?;
        Ok(Self { rate, burst })
    }
}

impl Default for BucketSpec {
    fn default() -> Self {
        let config = BudgetConfig::default();
        Self {
            rate: config.default_rate,
            burst: config.default_burst,
        }
    }
}

/// A single token bucket
///
/// Invariant: `0 <= tokens <= burst`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    spec: BucketSpec,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    /// Creates a full bucket
    pub fn new(spec: BucketSpec, now: Instant) -> Self {
        Self {
            spec,
            tokens: spec.burst as f64,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // Instants older than the last refill add nothing
        if now > self.last_refill {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.spec.rate).min(self.spec.burst as f64);
            self.last_refill = now;
        }
    }

    /// Spends one token, or returns how long until one is available
    pub fn try_acquire(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.last_used = self.last_used.max(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - self.tokens) / self.spec.rate)
                .unwrap_or(Duration::MAX)
        }
    }

    /// Puts back a token spent on a dispatch that did not happen
    pub fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.spec.burst as f64);
    }

    pub fn tokens(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn spec(&self) -> BucketSpec {
        self.spec
    }

    /// Changes rate and burst, clamping the current tokens to the new burst
    pub fn reconfigure(&mut self, spec: BucketSpec, now: Instant) {
        self.refill(now);
        self.spec = spec;
        self.tokens = self.tokens.min(spec.burst as f64);
    }

    /// Full and unused since `cutoff`: evicting it loses nothing
    fn is_idle(&mut self, now: Instant, cutoff: Instant) -> bool {
        self.last_used <= cutoff && self.tokens(now) >= self.spec.burst as f64
    }
}

#[derive(Debug, Default)]
struct Rules {
    default: BucketSpec,
    patterns: Vec<(DomainPattern, BucketSpec)>,
    overrides: HashMap<String, BucketSpec>,
    disabled: Vec<DomainPattern>,
}

impl Rules {
    fn resolve(&self, domain: &str) -> BucketSpec {
        if let Some(spec) = self.overrides.get(domain) {
            return *spec;
        }
        most_specific(&self.patterns, domain)
            .copied()
            .unwrap_or(self.default)
    }

    fn is_disabled(&self, domain: &str) -> bool {
        !self.overrides.contains_key(domain) && self.disabled.iter().any(|p| p.matches(domain))
    }
}

/// Table of per-domain token buckets, created lazily on first use
pub struct DomainBudget {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    rules: RwLock<Rules>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for DomainBudget {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl DomainBudget {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            buckets: DashMap::new(),
            rules: RwLock::new(Rules::default()),
            metrics,
        }
    }

    /// Builds a table from the `[budget]` defaults and `[[domain]]` rules
    ///
    /// # Returns
    ///
    /// The table plus one error per rule that was disabled
    pub fn from_config(
        budget: &BudgetConfig,
        rules: &[DomainRule],
        metrics: Arc<dyn MetricsSink>,
    ) -> ConfigResult<(Self, Vec<ConfigError>)> {
        let table = Self::new(metrics);
        table.set_default(budget.default_rate, budget.default_burst)?;
        let errors = table.set_rules(rules);
        Ok((table, errors))
    }

    fn read_rules(&self) -> std::sync::RwLockReadGuard<'_, Rules> {
        self.rules.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_rules(&self) -> std::sync::RwLockWriteGuard<'_, Rules> {
        self.rules.write().unwrap_or_else(|e| e.into_inner())
    }

    fn bucket(&self, domain: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(domain) {
            return bucket.clone();
        }
        let spec = self.read_rules().resolve(domain);
        self.buckets
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(spec, now))))
            .clone()
    }

    fn with_bucket<R>(&self, domain: &str, now: Instant, f: impl FnOnce(&mut TokenBucket) -> R) -> R {
        let bucket = self.bucket(domain, now);
        let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Attempts to spend one token for `domain`
    ///
    /// # Returns
    ///
    /// * `Duration::ZERO` - A token was consumed; dispatch may proceed
    /// * otherwise - Time until one token will have accrued; nothing consumed
    pub fn acquire(&self, domain: &str, now: Instant) -> Duration {
        let wait = self.with_bucket(domain, now, |bucket| bucket.try_acquire(now));
        if !wait.is_zero() {
            self.metrics.observe(
                names::BUDGET_WAIT_MS,
                wait.as_secs_f64() * 1000.0,
                &[("domain", domain)],
            );
        }
        wait
    }

    /// Returns a token taken by [`acquire`](Self::acquire) for a dispatch
    /// that a later admission step refused
    pub fn refund(&self, domain: &str) {
        if let Some(bucket) = self.buckets.get(domain).map(|b| b.clone()) {
            bucket.lock().unwrap_or_else(|e| e.into_inner()).refund();
        }
    }

    /// Current token count for `domain` (a fresh domain reports a full bucket)
    pub fn tokens(&self, domain: &str, now: Instant) -> f64 {
        match self.buckets.get(domain).map(|b| b.clone()) {
            Some(bucket) => bucket.lock().unwrap_or_else(|e| e.into_inner()).tokens(now),
            None => self.read_rules().resolve(domain).burst as f64,
        }
    }

    /// Rate and burst that apply to `domain`
    pub fn spec(&self, domain: &str) -> BucketSpec {
        self.read_rules().resolve(domain)
    }

    /// Sets an explicit rate for one domain, overriding any rule
    ///
    /// # Errors
    ///
    /// `InvalidDomainRate` if `rate` is not a positive finite number or
    /// `burst < 1`; the previous setting stays in place.
    pub fn configure(&self, domain: &str, rate: f64, burst: u32) -> ConfigResult<()> {
        check_rate(rate, burst).map_err(|reason| ConfigError::InvalidDomainRate {
            domain: domain.to_string(),
            reason,
        })?;
        let spec = BucketSpec { rate, burst };
        self.write_rules().overrides.insert(domain.to_string(), spec);

        if let Some(bucket) = self.buckets.get(domain).map(|b| b.clone()) {
            bucket
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .reconfigure(spec, Instant::now());
        }
        tracing::debug!("Budget for {} set to {}/s burst {}", domain, rate, burst);
        Ok(())
    }

    /// Sets the rate for domains without a rule
    pub fn set_default(&self, rate: f64, burst: u32) -> ConfigResult<()> {
        let spec = BucketSpec::new(rate, burst)?;
        self.write_rules().default = spec;
        self.respec_buckets();
        Ok(())
    }

    /// Replaces the `[[domain]]` rules
    ///
    /// Invalid rules disable the domains they match and are returned as
    /// errors; valid rules take effect immediately, including for existing
    /// buckets.
    pub fn set_rules(&self, rules: &[DomainRule]) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut patterns = Vec::with_capacity(rules.len());
        let mut disabled = Vec::new();

        for rule in rules {
            if let Err(e) = crate::config::validate_domain_pattern(&rule.pattern) {
                errors.push(e);
                continue;
            }
            let pattern = DomainPattern::parse(&rule.pattern);
            match check_rate(rule.rate, rule.burst) {
                Ok(()) => patterns.push((
                    pattern,
                    BucketSpec {
                        rate: rule.rate,
                        burst: rule.burst,
                    },
                )),
                Err(reason) => {
                    tracing::error!("Disabling {}: invalid rate ({})", pattern, reason);
                    errors.push(ConfigError::InvalidDomainRate {
                        domain: rule.pattern.clone(),
                        reason,
                    });
                    disabled.push(pattern);
                }
            }
        }

        {
            let mut current = self.write_rules();
            current.patterns = patterns;
            current.disabled = disabled;
        }
        self.respec_buckets();
        errors
    }

    /// True if an invalid rule disabled this domain
    pub fn is_disabled(&self, domain: &str) -> bool {
        self.read_rules().is_disabled(domain)
    }

    fn respec_buckets(&self) {
        let now = Instant::now();
        let rules = self.read_rules();
        for entry in self.buckets.iter() {
            let spec = rules.resolve(entry.key());
            let mut bucket = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            if bucket.spec() != spec {
                bucket.reconfigure(spec, now);
            }
        }
    }

    /// Drops buckets that are full and unused for `idle`
    ///
    /// # Returns
    ///
    /// Number of evicted buckets
    pub fn evict_idle(&self, now: Instant, idle: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(idle) else {
            return 0;
        };
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            !bucket
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_idle(now, cutoff)
        });
        before - self.buckets.len()
    }

    /// Number of domains with a live bucket
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
