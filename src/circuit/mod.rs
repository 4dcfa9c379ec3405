//! Per-domain circuit breakers
//!
//! # States
//! - Closed: dispatch allowed; failures are counted in a sliding window
//! - Open: dispatch blocked until the open duration elapses
//! - HalfOpen: exactly one probe task may be in flight
//!
//! # Transitions
//! ```text
//! Closed   → Open:     weighted failures within the window >= threshold
//! Open     → HalfOpen: open duration elapsed (on the next allow)
//! HalfOpen → Closed:   probe succeeds (open duration resets)
//! HalfOpen → Open:     probe fails (open duration doubles, capped)
//! ```
//!
//! Outcomes carry the [`Permit`] their dispatch was granted. Only the probe's
//! outcome moves a circuit out of HalfOpen; late results from dispatches made
//! while the circuit was still closed do not.
//!
//! An operator pause forces a domain closed to dispatch regardless of state.

use crate::config::CircuitConfig;
use crate::metrics::{names, MetricsSink, NoopMetrics};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Externally visible state of a domain's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// How much a failure counts toward the trip threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureWeight {
    /// A hard failure (transient network error, permanent block): counts 1
    Strong,
    /// A rate-limit signal: counts `rate-limit-weight`
    Weak,
}

/// What [`CircuitBreaker::admit`] granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    /// The single half-open trial request
    Probe,
}

#[derive(Debug, Clone)]
struct Settings {
    threshold: f64,
    window: Duration,
    open_duration: Duration,
    max_open_duration: Duration,
    rate_limit_weight: f64,
}

impl From<&CircuitConfig> for Settings {
    fn from(config: &CircuitConfig) -> Self {
        Self {
            threshold: config.threshold as f64,
            window: config.window(),
            open_duration: config.open_duration(),
            max_open_duration: config.max_open_duration(),
            rate_limit_weight: config.rate_limit_weight,
        }
    }
}

#[derive(Debug)]
struct DomainCircuit {
    state: CircuitState,
    failures: VecDeque<(Instant, f64)>,
    opened_at: Option<Instant>,
    open_for: Duration,
    probe_in_flight: bool,
    forced_open: bool,
    last_activity: Instant,
}

impl DomainCircuit {
    fn new(open_duration: Duration, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            open_for: open_duration,
            probe_in_flight: false,
            forced_open: false,
            last_activity: now,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.failures.front() {
            if now.saturating_duration_since(*at) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn weighted_failures(&self) -> f64 {
        self.failures.iter().map(|(_, w)| w).sum()
    }

    fn open_elapsed(&self, now: Instant) -> bool {
        self.opened_at
            .map(|at| now.saturating_duration_since(at) >= self.open_for)
            .unwrap_or(true)
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.failures.clear();
    }

    fn is_idle(&self, cutoff: Instant) -> bool {
        self.state == CircuitState::Closed
            && self.failures.is_empty()
            && !self.forced_open
            && !self.probe_in_flight
            && self.last_activity <= cutoff
    }
}

/// Table of per-domain circuits, created lazily on first reference
pub struct CircuitBreaker {
    circuits: DashMap<String, Arc<Mutex<DomainCircuit>>>,
    settings: RwLock<Settings>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(&CircuitConfig::default(), Arc::new(NoopMetrics))
    }
}

impl CircuitBreaker {
    pub fn new(config: &CircuitConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            circuits: DashMap::new(),
            settings: RwLock::new(Settings::from(config)),
            metrics,
        }
    }

    /// Applies new thresholds and durations; existing circuits keep their state
    pub fn set_config(&self, config: &CircuitConfig) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Settings::from(config);
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn circuit(&self, domain: &str, now: Instant) -> Arc<Mutex<DomainCircuit>> {
        if let Some(circuit) = self.circuits.get(domain) {
            return circuit.clone();
        }
        let open_duration = self.settings().open_duration;
        self.circuits
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DomainCircuit::new(open_duration, now))))
            .clone()
    }

    fn with_circuit<R>(&self, domain: &str, now: Instant, f: impl FnOnce(&mut DomainCircuit) -> R) -> R {
        let circuit = self.circuit(domain, now);
        let mut guard = circuit.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn existing<R>(&self, domain: &str, f: impl FnOnce(&mut DomainCircuit) -> R) -> Option<R> {
        let circuit = self.circuits.get(domain).map(|c| c.clone())?;
        let mut guard = circuit.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut guard))
    }

    /// Non-mutating check: would [`allow`](Self::allow) refuse right now?
    pub fn is_blocked(&self, domain: &str, now: Instant) -> bool {
        self.existing(domain, |c| {
            if c.forced_open {
                return true;
            }
            match c.state {
                CircuitState::Closed => false,
                CircuitState::Open => !c.open_elapsed(now),
                CircuitState::HalfOpen => c.probe_in_flight,
            }
        })
        .unwrap_or(false)
    }

    /// Claims permission to dispatch to `domain`
    ///
    /// In Open state past the open duration, this moves the circuit to
    /// HalfOpen and grants the single probe. Every later call is refused
    /// until the probe resolves.
    pub fn admit(&self, domain: &str, now: Instant) -> Option<Permit> {
        let permit = self.with_circuit(domain, now, |c| {
            if c.forced_open {
                return None;
            }
            match c.state {
                CircuitState::Closed => Some(Permit::Normal),
                CircuitState::Open if c.open_elapsed(now) => {
                    c.state = CircuitState::HalfOpen;
                    c.probe_in_flight = true;
                    c.last_activity = now;
                    Some(Permit::Probe)
                }
                CircuitState::Open => None,
                CircuitState::HalfOpen if !c.probe_in_flight => {
                    c.probe_in_flight = true;
                    c.last_activity = now;
                    Some(Permit::Probe)
                }
                CircuitState::HalfOpen => None,
            }
        });

        if permit == Some(Permit::Probe) {
            tracing::info!("Circuit for {} half-open, sending probe", domain);
            self.metrics
                .increment(names::CIRCUIT_PROBE, &[("domain", domain)]);
        }
        permit
    }

    /// Whether dispatch to `domain` may proceed (claims the probe if due)
    ///
    /// Callers that report outcomes should use [`admit`](Self::admit) so they
    /// know whether they hold the probe.
    pub fn allow(&self, domain: &str, now: Instant) -> bool {
        self.admit(domain, now).is_some()
    }

    /// Records a successful fetch
    ///
    /// A normal success clears the failure window of a closed circuit. Only
    /// the probe's success closes a half-open circuit (and resets its open
    /// duration); stragglers dispatched before the trip are ignored.
    pub fn record_success(&self, domain: &str, permit: Permit) {
        let now = Instant::now();
        let base = self.settings().open_duration;
        let closed = self
            .existing(domain, |c| {
                c.last_activity = now;
                match (c.state, permit) {
                    (CircuitState::HalfOpen, Permit::Probe) if c.probe_in_flight => {
                        c.state = CircuitState::Closed;
                        c.failures.clear();
                        c.probe_in_flight = false;
                        c.opened_at = None;
                        c.open_for = base;
                        true
                    }
                    (CircuitState::Closed, _) => {
                        c.failures.clear();
                        false
                    }
                    _ => false,
                }
            })
            .unwrap_or(false);

        if closed {
            tracing::info!("Circuit for {} closed after successful probe", domain);
            self.metrics
                .increment(names::CIRCUIT_CLOSED, &[("domain", domain)]);
        }
    }

    /// Records a failed fetch
    ///
    /// Failures count toward the threshold only while the circuit is closed.
    /// A failed probe re-opens a half-open circuit with a doubled open
    /// duration; other failures reported while open or half-open are ignored.
    ///
    /// # Returns
    ///
    /// `true` if this failure opened (or re-opened) the circuit
    pub fn record_failure(
        &self,
        domain: &str,
        now: Instant,
        weight: FailureWeight,
        permit: Permit,
    ) -> bool {
        let settings = self.settings();
        let weight_value = match weight {
            FailureWeight::Strong => 1.0,
            FailureWeight::Weak => settings.rate_limit_weight,
        };

        let opened = self.with_circuit(domain, now, |c| {
            c.last_activity = now;
            match (c.state, permit) {
                (CircuitState::Closed, _) => {
                    c.prune(now, settings.window);
                    c.failures.push_back((now, weight_value));
                    // tolerate float drift when summing fractional weights
                    if c.weighted_failures() + 1e-9 >= settings.threshold {
                        c.open_for = settings.open_duration;
                        c.open(now);
                        Some(c.open_for)
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, Permit::Probe) if c.probe_in_flight => {
                    c.open_for = (c.open_for * 2).min(settings.max_open_duration);
                    c.open(now);
                    Some(c.open_for)
                }
                _ => None,
            }
        });

        match opened {
            Some(open_for) => {
                tracing::warn!(
                    "Circuit for {} opened for {:.1}s",
                    domain,
                    open_for.as_secs_f64()
                );
                self.metrics
                    .increment(names::CIRCUIT_OPENED, &[("domain", domain)]);
                true
            }
            None => false,
        }
    }

    /// Gives up a claimed probe without a verdict (e.g. the proxy failed)
    pub fn release_probe(&self, domain: &str) {
        self.existing(domain, |c| {
            if c.state == CircuitState::HalfOpen {
                c.probe_in_flight = false;
            }
        });
    }

    /// Operator pause: refuse all dispatch to `domain` until resumed
    pub fn force_open(&self, domain: &str) {
        self.with_circuit(domain, Instant::now(), |c| c.forced_open = true);
        tracing::info!("Domain {} paused", domain);
    }

    /// Lifts an operator pause; the underlying state is unchanged
    pub fn resume(&self, domain: &str) {
        let now = Instant::now();
        self.existing(domain, |c| {
            c.forced_open = false;
            c.last_activity = now;
        });
        tracing::info!("Domain {} resumed", domain);
    }

    pub fn is_paused(&self, domain: &str) -> bool {
        self.existing(domain, |c| c.forced_open).unwrap_or(false)
    }

    pub fn state(&self, domain: &str) -> CircuitState {
        self.existing(domain, |c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Current open duration (grows with failed probes)
    pub fn open_duration(&self, domain: &str) -> Duration {
        self.existing(domain, |c| c.open_for)
            .unwrap_or_else(|| self.settings().open_duration)
    }

    /// Time until an open circuit admits its probe, if it is open
    pub fn time_until_probe(&self, domain: &str, now: Instant) -> Option<Duration> {
        self.existing(domain, |c| match (c.state, c.opened_at) {
            (CircuitState::Open, Some(at)) if !c.forced_open => {
                Some((at + c.open_for).saturating_duration_since(now))
            }
            _ => None,
        })
        .flatten()
    }

    /// Drops circuits that are closed, clean and untouched for `idle`
    pub fn evict_idle(&self, now: Instant, idle: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(idle) else {
            return 0;
        };
        let window = self.settings().window;
        let before = self.circuits.len();
        self.circuits.retain(|_, circuit| {
            let mut c = circuit.lock().unwrap_or_else(|e| e.into_inner());
            c.prune(now, window);
            !c.is_idle(cutoff)
        });
        before - self.circuits.len()
    }

    /// Number of domains with a live circuit
    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;

    fn config(threshold: u32) -> CircuitConfig {
        CircuitConfig {
            threshold,
            window_secs: 60,
            open_duration_ms: 1_000,
            max_open_duration_ms: 3_000,
            rate_limit_weight: 0.5,
        }
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(&config(threshold), Arc::new(NoopMetrics))
    }

    fn fail(domain: &str, breaker: &CircuitBreaker, now: Instant) -> bool {
        breaker.record_failure(domain, now, FailureWeight::Strong, Permit::Normal)
    }

    #[test]
    fn test_unknown_domain_is_closed() {
        let breaker = breaker(5);
        let now = Instant::now();
        assert_eq!(breaker.state("example.com"), CircuitState::Closed);
        assert!(!breaker.is_blocked("example.com", now));
        assert!(breaker.allow("example.com", now));
    }

    #[test]
    fn test_trip_after_threshold_then_single_probe() {
        let breaker = breaker(5);
        let now = Instant::now();

        for i in 0..4 {
            assert!(!fail("example.com", &breaker, now), "{i}");
            assert!(breaker.allow("example.com", now));
        }
        assert!(fail("example.com", &breaker, now));
        assert_eq!(breaker.state("example.com"), CircuitState::Open);

        let almost = now + Duration::from_millis(999);
        assert!(!breaker.allow("example.com", almost));
        assert!(breaker.is_blocked("example.com", almost));

        let elapsed = now + Duration::from_secs(1);
        assert!(!breaker.is_blocked("example.com", elapsed));
        assert_eq!(breaker.admit("example.com", elapsed), Some(Permit::Probe));
        assert_eq!(breaker.state("example.com"), CircuitState::HalfOpen);
        for _ in 0..3 {
            assert!(!breaker.allow("example.com", elapsed));
        }
        assert!(breaker.is_blocked("example.com", elapsed));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3);
        let now = Instant::now();
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        breaker.record_success("example.com", Permit::Normal);
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        assert_eq!(breaker.state("example.com"), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_expire() {
        let breaker = breaker(3);
        let start = Instant::now();
        breaker.record_failure("example.com", start, FailureWeight::Strong, Permit::Normal);
        breaker.record_failure("example.com", start, FailureWeight::Strong, Permit::Normal);

        let later = start + Duration::from_secs(61);
        assert!(!fail("example.com", &breaker, later));
        assert_eq!(breaker.state("example.com"), CircuitState::Closed);
    }

    #[test]
    fn test_weak_failures_count_half() {
        let breaker = breaker(2);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(!breaker.record_failure(
                "example.com",
                now,
                FailureWeight::Weak,
                Permit::Normal
            ));
        }
        assert!(breaker.record_failure("example.com", now, FailureWeight::Weak, Permit::Normal));
        assert_eq!(breaker.state("example.com"), CircuitState::Open);
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = breaker(1);
        let now = Instant::now();
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        let probe_at = now + Duration::from_secs(1);
        assert_eq!(breaker.admit("example.com", probe_at), Some(Permit::Probe));

        breaker.record_success("example.com", Permit::Probe);
        assert_eq!(breaker.state("example.com"), CircuitState::Closed);
        assert!(breaker.allow("example.com", probe_at));
        assert!(breaker.allow("example.com", probe_at));
    }

    #[test]
    fn test_probe_failure_doubles_open_duration_with_cap() {
        let breaker = breaker(1);
        let mut now = Instant::now();
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        assert_eq!(breaker.open_duration("example.com"), Duration::from_secs(1));

        for expected in [2, 3, 3] {
            now += breaker.open_duration("example.com");
            assert_eq!(breaker.admit("example.com", now), Some(Permit::Probe));
            assert!(breaker.record_failure(
                "example.com",
                now,
                FailureWeight::Strong,
                Permit::Probe
            ));
            assert_eq!(
                breaker.open_duration("example.com"),
                Duration::from_secs(expected)
            );
            assert!(!breaker.allow("example.com", now + Duration::from_millis(1500)));
        }

        // a successful probe resets the duration
        now += breaker.open_duration("example.com");
        assert!(breaker.allow("example.com", now));
        breaker.record_success("example.com", Permit::Probe);
        assert_eq!(breaker.open_duration("example.com"), Duration::from_secs(1));
    }

    #[test]
    fn test_late_failure_ignored_while_half_open() {
        let breaker = breaker(2);
        let now = Instant::now();
        // three dispatches while closed; two fail and trip the circuit
        assert_eq!(breaker.admit("example.com", now), Some(Permit::Normal));
        fail("example.com", &breaker, now);
        fail("example.com", &breaker, now);

        let probe_at = now + Duration::from_secs(1);
        assert_eq!(breaker.admit("example.com", probe_at), Some(Permit::Probe));

        // the third, dispatched before the trip, fails afterwards
        assert!(!fail("example.com", &breaker, probe_at));
        assert_eq!(breaker.state("example.com"), CircuitState::HalfOpen);
        assert_eq!(breaker.open_duration("example.com"), Duration::from_secs(1));

        let next_boundary = probe_at + Duration::from_secs(1);
        assert!(breaker.is_blocked("example.com", next_boundary));
        assert_eq!(breaker.admit("example.com", next_boundary), None);

        // the half-open dispatch itself still re-opens
        assert!(breaker.record_failure(
            "example.com",
            next_boundary,
            FailureWeight::Strong,
            Permit::Probe
        ));
        assert_eq!(breaker.open_duration("example.com"), Duration::from_secs(2));
    }

    #[test]
    fn test_late_success_does_not_close_half_open() {
        let breaker = breaker(1);
        let now = Instant::now();
        fail("example.com", &breaker, now);
        let probe_at = now + Duration::from_secs(1);
        assert_eq!(breaker.admit("example.com", probe_at), Some(Permit::Probe));

        breaker.record_success("example.com", Permit::Normal);
        assert_eq!(breaker.state("example.com"), CircuitState::HalfOpen);
        assert_eq!(breaker.admit("example.com", probe_at), None);

        breaker.record_success("example.com", Permit::Probe);
        assert_eq!(breaker.state("example.com"), CircuitState::Closed);
    }

    #[test]
    fn test_release_probe_allows_another() {
        let breaker = breaker(1);
        let now = Instant::now();
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        let later = now + Duration::from_secs(1);
        assert!(breaker.allow("example.com", later));
        assert!(!breaker.allow("example.com", later));

        breaker.release_probe("example.com");
        assert_eq!(breaker.state("example.com"), CircuitState::HalfOpen);
        assert!(breaker.allow("example.com", later));
    }

    #[test]
    fn test_force_open_and_resume() {
        let breaker = breaker(5);
        let now = Instant::now();
        breaker.force_open("example.com");
        assert!(breaker.is_paused("example.com"));
        assert!(breaker.is_blocked("example.com", now));
        assert!(!breaker.allow("example.com", now + Duration::from_secs(3600)));

        breaker.resume("example.com");
        assert!(!breaker.is_paused("example.com"));
        assert!(breaker.allow("example.com", now));
    }

    #[test]
    fn test_time_until_probe() {
        let breaker = breaker(1);
        let now = Instant::now();
        assert_eq!(breaker.time_until_probe("example.com", now), None);
        breaker.record_failure("example.com", now, FailureWeight::Strong, Permit::Normal);
        assert_eq!(
            breaker.time_until_probe("example.com", now + Duration::from_millis(400)),
            Some(Duration::from_millis(600))
        );
    }

    #[test]
    fn test_evict_idle() {
        let breaker = breaker(5);
        let now = Instant::now();
        breaker.allow("clean.com", now);
        breaker.record_failure("failing.com", now, FailureWeight::Strong, Permit::Normal);
        breaker.force_open("paused.com");

        let later = now + Duration::from_secs(30);
        assert_eq!(breaker.evict_idle(later, Duration::from_secs(10)), 1);
        assert_eq!(breaker.len(), 2);

        // once the failure leaves the window the circuit is clean again
        let much_later = now + Duration::from_secs(120);
        assert_eq!(breaker.evict_idle(much_later, Duration::from_secs(10)), 1);
        assert!(breaker.is_paused("paused.com"));
    }

    #[test]
    fn test_trip_emits_metric() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let breaker = CircuitBreaker::new(&config(1), metrics.clone());
        breaker.record_failure(
            "example.com",
            Instant::now(),
            FailureWeight::Strong,
            Permit::Normal,
        );
        assert_eq!(
            metrics.counter(names::CIRCUIT_OPENED, &[("domain", "example.com")]),
            1
        );
    }
}
