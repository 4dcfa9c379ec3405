//! Admission and outcome handling for the crawl loop
//!
//! This module handles:
//! - Picking the next dispatchable task out of the frontier
//! - Admission through the domain's circuit, its token bucket and a proxy lease
//! - Turning a fetch outcome into a frontier transition (done, retry, abandon)
//! - Feeding outcomes back into circuit and proxy health
//!
//! The scheduler is the only component that moves tasks between states.
//! Workers hand their results back here; they never touch the frontier.

use super::coordinator::TaskReport;
use super::fetcher::FetchResponse;
use crate::budget::DomainBudget;
use crate::circuit::{CircuitBreaker, FailureWeight, Permit};
use crate::frontier::{Frontier, UrlTask};
use crate::metrics::{names, MetricsSink};
use crate::proxy::{ProxyLease, ProxyRotator};
use crate::retry::{ErrorKind, FetchError, RetryPolicy};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Everything a dispatch was granted besides the task itself
#[derive(Debug)]
pub struct Admission {
    /// Leased proxy; `None` when fetching directly
    pub proxy: Option<ProxyLease>,

    /// This dispatch is the half-open probe for its domain
    pub probe: bool,
}

/// A task cleared for fetching
#[derive(Debug)]
pub struct Dispatch {
    pub task: UrlTask,
    pub admission: Admission,
}

/// Result of asking the scheduler for work
#[derive(Debug)]
pub enum Decision {
    Dispatch(Dispatch),

    /// Nothing admissible right now
    Idle {
        /// Earliest known time something may become admissible
        wake_in: Option<Duration>,
    },
}

/// Per-call bookkeeping of why domains were refused
#[derive(Default)]
struct Refusals {
    wake_in: Option<Duration>,
}

impl Refusals {
    fn wait(&mut self, wait: Duration) {
        self.wake_in = Some(self.wake_in.map_or(wait, |w| w.min(wait)));
    }
}

/// Combines frontier, budgets, circuits and proxies into dispatch decisions
pub struct Scheduler {
    frontier: Arc<Frontier>,
    budget: Arc<DomainBudget>,
    circuits: Arc<CircuitBreaker>,
    proxies: Arc<ProxyRotator>,
    policy: RwLock<RetryPolicy>,
    metrics: Arc<dyn MetricsSink>,
}

impl Scheduler {
    pub fn new(
        frontier: Arc<Frontier>,
        budget: Arc<DomainBudget>,
        circuits: Arc<CircuitBreaker>,
        proxies: Arc<ProxyRotator>,
        policy: RetryPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        frontier.set_policy(&policy);
        Self {
            frontier,
            budget,
            circuits,
            proxies,
            policy: RwLock::new(policy),
            metrics,
        }
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    pub fn budget(&self) -> &Arc<DomainBudget> {
        &self.budget
    }

    pub fn circuits(&self) -> &Arc<CircuitBreaker> {
        &self.circuits
    }

    pub fn proxies(&self) -> &Arc<ProxyRotator> {
        &self.proxies
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replaces the retry policy; tasks already queued keep their ledgers
    pub fn set_policy(&self, policy: RetryPolicy) {
        self.frontier.set_policy(&policy);
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Picks the next task to dispatch
    ///
    /// Domains are considered in the order of their best ready task. For each
    /// one the checks run cheapest first: disabled, circuit, token, probe
    /// claim, proxy. A check that fails after a token was spent gives the
    /// token back.
    pub fn next(&self, now: Instant) -> Decision {
        let mut refusals = Refusals::default();
        let picked = self
            .frontier
            .pop_ready_with(now, |task| self.admit(task, now, &mut refusals));

        match picked {
            Some((task, admission)) => {
                let proxy_id = admission.proxy.as_ref().map(|l| l.id().to_string());
                if proxy_id.is_some() {
                    self.frontier
                        .update_in_flight(&task.url, |t| t.last_proxy = proxy_id.clone());
                }
                tracing::debug!(
                    "Dispatching {} (attempt {}/{}{})",
                    task.url,
                    task.attempt_count(),
                    task.ledger.max_attempts(),
                    if admission.probe { ", probe" } else { "" }
                );
                self.metrics
                    .increment(names::TASK_DISPATCHED, &[("domain", &task.domain)]);
                Decision::Dispatch(Dispatch { task, admission })
            }
            None => {
                if let Some(at) = self.frontier.next_not_before() {
                    refusals.wait(at.saturating_duration_since(now));
                }
                Decision::Idle {
                    wake_in: refusals.wake_in,
                }
            }
        }
    }

    fn admit(&self, task: &UrlTask, now: Instant, refusals: &mut Refusals) -> Option<Admission> {
        let domain = task.domain.as_str();

        if self.budget.is_disabled(domain) {
            return None;
        }

        if self.circuits.is_blocked(domain, now) {
            if let Some(wait) = self.circuits.time_until_probe(domain, now) {
                refusals.wait(wait);
            }
            return None;
        }

        let wait = self.budget.acquire(domain, now);
        if !wait.is_zero() {
            refusals.wait(wait);
            return None;
        }

        let Some(permit) = self.circuits.admit(domain, now) else {
            self.budget.refund(domain);
            return None;
        };
        let probe = permit == Permit::Probe;

        if self.proxies.is_direct() {
            return Some(Admission { proxy: None, probe });
        }

        // After a proxy failure, prefer any other endpoint
        let avoid = match task.last_error_kind() {
            Some(ErrorKind::Proxy) => task.last_proxy.as_deref(),
            _ => None,
        };
        match self.proxies.select_avoiding(domain, now, avoid) {
            Ok(lease) => Some(Admission {
                proxy: Some(lease),
                probe,
            }),
            Err(e) => {
                tracing::debug!("Holding {}: {}", task.url, e);
                self.budget.refund(domain);
                if probe {
                    self.circuits.release_probe(domain);
                }
                None
            }
        }
    }

    /// Applies the outcome of one dispatch
    ///
    /// # Arguments
    ///
    /// * `task` - The task as it was dispatched
    /// * `admission` - What the dispatch was granted (the lease is released here)
    /// * `result` - What the fetcher returned
    /// * `latency` - Wall time of the fetch
    /// * `now` - Reference time for circuit windows and retry delays
    ///
    /// # Returns
    ///
    /// A report when the task reached a terminal state
    pub fn on_outcome(
        &self,
        task: &UrlTask,
        admission: Admission,
        result: Result<FetchResponse, FetchError>,
        latency: Duration,
        now: Instant,
    ) -> Option<TaskReport> {
        let domain = task.domain.as_str();
        let Admission { proxy, probe } = admission;
        let proxy_id = proxy.as_ref().map(|l| l.id().to_string());
        drop(proxy);

        // Proxy health is tracked whatever happened to the task meanwhile
        if let Some(id) = proxy_id.as_deref() {
            match &result {
                Ok(_) => self.proxies.report_success(id, latency),
                Err(FetchError::Proxy(_)) => {
                    self.proxies.report_failure(id, now);
                }
                // The target answered, so the proxy did its job
                Err(FetchError::RateLimited { .. })
                | Err(FetchError::PermanentBlock(_))
                | Err(FetchError::Rejected(_)) => self.proxies.report_success(id, latency),
                Err(FetchError::TransientNetwork(_)) => {}
            }
        }

        match result {
            Ok(response) => self.on_success(task, response, probe, latency),
            Err(error) => self.on_failure(task, error, probe, now),
        }
    }

    /// Drops a result whose task left InFlight while it was being fetched
    fn discard(&self, task: &UrlTask, probe: bool) -> Option<TaskReport> {
        let domain = task.domain.as_str();
        tracing::debug!("Discarding result for {} (no longer in flight)", task.url);
        if probe {
            self.circuits.release_probe(domain);
        }
        self.metrics
            .increment(names::TASK_DISCARDED, &[("domain", domain)]);
        None
    }

    fn on_success(
        &self,
        task: &UrlTask,
        response: FetchResponse,
        probe: bool,
        latency: Duration,
    ) -> Option<TaskReport> {
        let domain = task.domain.as_str();
        if !self.frontier.complete(&task.url) {
            return self.discard(task, probe);
        }
        self.circuits.record_success(domain, permit_of(probe));
        self.metrics.observe(
            names::FETCH_LATENCY_MS,
            latency.as_secs_f64() * 1000.0,
            &[("domain", domain)],
        );
        tracing::info!(
            "Fetched {} ({}, {} bytes, {:?})",
            task.url,
            response.status_code,
            response.body.len(),
            latency
        );
        self.metrics.increment(names::TASK_DONE, &[("domain", domain)]);
        let record = self.frontier.get(&task.url)?;
        Some(TaskReport::from_task(&record, Some(response)))
    }

    fn on_failure(
        &self,
        task: &UrlTask,
        error: FetchError,
        probe: bool,
        now: Instant,
    ) -> Option<TaskReport> {
        let domain = task.domain.as_str();
        let kind = error.kind();
        let permit = permit_of(probe);

        // Record first so the ledger used below includes this failure
        let Some(ledger) = self.frontier.update_in_flight(&task.url, |t| {
            t.ledger.record_error(&error);
            if !kind.charges_attempt() {
                t.ledger.refund_attempt();
            }
            t.ledger.clone()
        }) else {
            return self.discard(task, probe);
        };
        self.metrics.increment(
            names::FETCH_ERROR,
            &[("domain", domain), ("kind", kind.as_str())],
        );
        let policy = self.policy();

        if self.circuits.is_paused(domain) {
            // A pause is not the task's fault; hold it until resumed
            if kind.charges_attempt() {
                self.frontier
                    .update_in_flight(&task.url, |t| t.ledger.refund_attempt());
            }
            if probe {
                self.circuits.release_probe(domain);
            }
            self.frontier.release(&task.url);
            return None;
        }

        let retry = match kind {
            ErrorKind::Proxy => {
                if probe {
                    self.circuits.release_probe(domain);
                }
                // The count already includes this failure
                policy.should_retry_proxy(ledger.proxy_retries().saturating_sub(1))
            }
            ErrorKind::TransientNetwork => {
                self.circuits
                    .record_failure(domain, now, FailureWeight::Strong, permit);
                policy.should_retry(ledger.attempt_count(), kind)
            }
            ErrorKind::RateLimited => {
                self.circuits
                    .record_failure(domain, now, FailureWeight::Weak, permit);
                policy.should_retry(ledger.attempt_count(), kind)
            }
            ErrorKind::PermanentBlock => {
                self.circuits
                    .record_failure(domain, now, FailureWeight::Strong, permit);
                false
            }
            ErrorKind::Rejected => {
                if probe {
                    self.circuits.release_probe(domain);
                }
                false
            }
        };

        if retry {
            let requeued = if kind == ErrorKind::Proxy {
                self.frontier.release(&task.url)
            } else {
                let delay = policy.next_delay(ledger.attempt_count(), &error);
                tracing::debug!(
                    "Retrying {} in {:?} after {} (attempt {}/{})",
                    task.url,
                    delay,
                    kind,
                    ledger.attempt_count(),
                    ledger.max_attempts()
                );
                self.frontier.requeue(&task.url, now + delay)
            };
            if requeued {
                self.metrics.increment(
                    names::TASK_RETRIED,
                    &[("domain", domain), ("kind", kind.as_str())],
                );
            }
            return None;
        }

        if !self.frontier.abandon(&task.url) {
            return None;
        }
        tracing::warn!(
            "Abandoned {} after {} attempt(s): {}",
            task.url,
            ledger.attempt_count(),
            error
        );
        self.metrics.increment(
            names::TASK_ABANDONED,
            &[("domain", domain), ("kind", kind.as_str())],
        );
        let record = self.frontier.get(&task.url)?;
        Some(TaskReport::from_task(&record, None))
    }
}

fn permit_of(probe: bool) -> Permit {
    if probe {
        Permit::Probe
    } else {
        Permit::Normal
    }
}
